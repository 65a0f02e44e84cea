use {
    crate::{
        error::Err as ErrorKind,
        prelude::*,
        server::{Registry, TrafficServer},
        traffic::{ResponseHandle, Traffic},
    },
    std::{io, net::Shutdown},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    },
};

/// Raw socket traffic, either a client payload heading for the registered
/// peer or a server reply heading back to the SUT
pub struct SocketMessage {
    pub text: String,
    pub handle: ResponseHandle,
}

/// Handles a `SUT_SERVER` announcement: the first one registers the peer
/// address found in the payload's last word and swaps the canonical socket
/// directions for the rest of the process lifetime
pub fn server_state(text: String, handle: ResponseHandle, registry: &Registry) -> SocketMessage {
    if registry.peer().is_none() {
        match parse_peer(&text) {
            Ok(addr) => registry.set_peer(addr),
            Err(e) => {
                e.log(Level::WARN);
            }
        }
    }
    SocketMessage { text, handle }
}

fn parse_peer(text: &str) -> CrateResult<(String, u16)> {
    let address = || ErrorKind::Address { text: text.into() };

    let last_word = text.split_whitespace().last().ok_or_else(address)?;
    let mut halves = last_word.rsplitn(2, ':');
    let port = halves
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(address)?;
    let host = halves.next().ok_or_else(address)?;
    Ok((host.to_string(), port))
}

/// Plays fake client: forwards the payload to the registered peer,
/// half-closes, and reads the reply until EOF. A reset peer is a warning on
/// our stderr and no response at all
pub async fn forward_client(message: &SocketMessage, server: &TrafficServer) -> Vec<Traffic> {
    let (host, port) = match server.registry.peer() {
        Some(peer) => peer,
        None => return Vec::new(),
    };

    match round_trip(&host, port, &message.text).await {
        Ok(reply) => vec![Traffic::Server(SocketMessage {
            text: reply,
            handle: message.handle.clone(),
        })],
        Err(_) => {
            eprintln!(
                "WARNING: Server process reset the connection while the fake client \
                 was trying to read a response from it!"
            );
            eprintln!(
                "(while running test at {})",
                server.config.test_path.as_deref().unwrap_or("<unknown>")
            );
            Vec::new()
        }
    }
}

async fn round_trip(host: &str, port: u16, text: &str) -> io::Result<String> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.write_all(text.as_bytes()).await?;
    stream.shutdown(Shutdown::Write)?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addresses_come_from_the_last_word() {
        assert_eq!(
            parse_peer("my server is up on 127.0.0.1:9000\n").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            parse_peer("justhost:80").unwrap(),
            ("justhost".to_string(), 80)
        );
    }

    #[test]
    fn bad_peer_addresses_are_rejected() {
        assert!(parse_peer("").is_err());
        assert!(parse_peer("no port here").is_err());
        assert!(parse_peer("host:notaport").is_err());
    }

    #[test]
    fn registration_is_write_once_and_swaps_directions() {
        let registry = Registry::new();
        assert!(!registry.swapped());

        server_state("up at a:1".into(), ResponseHandle::sink(), &registry);
        assert_eq!(registry.peer(), Some(("a".to_string(), 1)));
        assert!(registry.swapped());

        // a second announcement cannot re-point the peer
        server_state("up at b:2".into(), ResponseHandle::sink(), &registry);
        assert_eq!(registry.peer(), Some(("a".to_string(), 1)));
    }
}
