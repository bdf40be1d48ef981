use socket2::{Domain, Socket, Type};
use std::net::{AddrParseError, SocketAddr};

const LISTEN_BACKLOG: i32 = 128;

/// Build a non-blocking listener socket with address and port reuse enabled,
/// so a restarted process can rebind immediately.
pub fn listen_reuse_socket(addr: &SocketAddr) -> Result<Socket, std::io::Error> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket)
}

/// Parse a listen address, accepting the ":port" shorthand for all interfaces.
pub fn parse_address(mut addr: String) -> Result<SocketAddr, AddrParseError> {
    if addr.starts_with(':') {
        addr.insert_str(0, "0.0.0.0");
    }

    addr.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_full() {
        let addr = parse_address("127.0.0.1:9091".to_string()).unwrap();
        assert_eq!(addr.port(), 9091);
    }

    #[test]
    fn parse_address_port_shorthand() {
        let addr = parse_address(":8080".to_string()).unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn parse_address_invalid() {
        assert!(parse_address("not-an-address".to_string()).is_err());
    }
}
