use tracing::debug;

/// Bind-and-release probe: true when the port can be bound on 127.0.0.1
/// right now. The listener is dropped immediately; the caller still has to
/// guard against table-level double allocation itself.
pub fn port_is_bindable(port: u16) -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => true,
        Err(e) => {
            debug!("port {} not bindable: {}", port, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupied_port_is_not_bindable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_bindable(port));
        drop(listener);
        assert!(port_is_bindable(port));
    }
}
