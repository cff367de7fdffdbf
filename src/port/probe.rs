use std::net::TcpListener;

/// Answers "could something bind this port right now?".
///
/// The answer is stale the moment it is returned; callers that later fail
/// to bind must treat that as a normal outcome and allocate again.
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16) -> bool;
}

/// Probes by binding a listener and dropping it immediately.
///
/// Both loopback and the wildcard address are tried: on macOS a bind to
/// 127.0.0.1 succeeds even while 0.0.0.0 is taken.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_available(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        TcpListener::bind(("127.0.0.1", port)).is_ok()
            && TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn is_available(&self, port: u16) -> bool {
        self(port)
    }
}
