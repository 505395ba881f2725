//! APRS-IS TCP login probe.
//!
//! Connect, expect a `#` greeting, log in unverified and check that the
//! server identifies itself correctly.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const MYCALL: &str = "APRS2N-ET";

/// APRS-IS client port; hubs listen for their peers on a separate port.
pub const PORT: u16 = 14580;
pub const HUB_PORT: u16 = 20152;

const SOCK_TIMEOUT: Duration = Duration::from_secs(5);

static RE_LOGIN_OK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"# logresp (\S+) (\S+), server ([A-Z0-9-]+)").expect("static regex")
});

/// A failed probe; `code` is the per-family suffix (`socket`, `acl`, ...).
#[derive(Debug)]
pub struct IsError {
    pub code: &'static str,
    pub message: String,
}

impl IsError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The port a server is expected to answer APRS-IS on.
pub fn port_for(server_id: &str) -> u16 {
    if server_id.starts_with("T2HUB") {
        HUB_PORT
    } else {
        PORT
    }
}

pub async fn probe(addr: IpAddr, port: u16, server_id: &str) -> Result<(), IsError> {
    let target = SocketAddr::new(addr, port);

    let mut stream = match timeout(SOCK_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(IsError::new("socket", format!("APRS-IS port firewalled: {e}")));
        }
        Ok(Err(e)) => {
            return Err(IsError::new("socket", format!("APRS-IS socket error: {e}")));
        }
        Err(_) => {
            return Err(IsError::new("socket", "APRS-IS connect timed out"));
        }
    };

    let greeting = read_line(&mut stream).await?;
    if greeting.is_empty() {
        return Err(IsError::new(
            "acl",
            "Server closed connection immediately without sending version string (ACL?)",
        ));
    }

    let login = format!("user {MYCALL} pass -1 vers aprs2net-poll 2.0\r\n");
    match timeout(SOCK_TIMEOUT, stream.write_all(login.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(IsError::new("socket", format!("APRS-IS socket error: {e}"))),
        Err(_) => return Err(IsError::new("socket", "APRS-IS login write timed out")),
    }

    let response = read_line(&mut stream).await?;

    let Some(m) = RE_LOGIN_OK.captures(&response) else {
        return Err(IsError::new(
            "unrecognized",
            format!("APRS-IS login response line not recognized: {response:?}"),
        ));
    };

    if &m[1] != MYCALL {
        return Err(IsError::new(
            "login",
            format!("APRS-IS login response does not contain my callsign {MYCALL}"),
        ));
    }

    if &m[2] != "unverified" {
        return Err(IsError::new(
            "verification",
            format!(
                "APRS-IS login response is not 'unverified' for pass -1: got '{}'",
                &m[2]
            ),
        ));
    }

    if &m[3] != server_id {
        return Err(IsError::new(
            "serverid",
            format!(
                "APRS-IS login response for '{server_id}' has unexpected server ID: '{}'",
                &m[3]
            ),
        ));
    }

    if response.contains(r#"adjunct "filter default" filter"#) {
        return Err(IsError::new(
            "defaultfilter",
            format!("APRS-IS login response for '{server_id}' says a default filter is configured"),
        ));
    }

    Ok(())
}

async fn read_line(stream: &mut TcpStream) -> Result<String, IsError> {
    let mut buf = [0u8; 1024];

    let n = match timeout(SOCK_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(IsError::new("socket", format!("APRS-IS socket error: {e}"))),
        Err(_) => return Err(IsError::new("socket", "APRS-IS read timed out")),
    };

    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Fake APRS-IS server that greets, reads the login and answers with
    /// `response`.
    async fn fake_server(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"# aprsc 2.1.15-g50579e9\r\n")
                .await
                .unwrap();

            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();

            stream.write_all(response.as_bytes()).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn successful_unverified_login() {
        let addr = fake_server("# logresp APRS2N-ET unverified, server T2FINLAND\r\n").await;

        probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap();
    }

    #[tokio::test]
    async fn empty_greeting_is_an_acl_block() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "acl");
    }

    #[tokio::test]
    async fn unparseable_response_is_unrecognized() {
        let addr = fake_server("# invalid gibberish\r\n").await;

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "unrecognized");
    }

    #[tokio::test]
    async fn wrong_callsign_echo_fails_login() {
        let addr = fake_server("# logresp N0CALL unverified, server T2FINLAND\r\n").await;

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "login");
    }

    #[tokio::test]
    async fn verified_answer_for_pass_minus_one_fails() {
        let addr = fake_server("# logresp APRS2N-ET verified, server T2FINLAND\r\n").await;

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "verification");
    }

    #[tokio::test]
    async fn wrong_server_id_fails() {
        let addr = fake_server("# logresp APRS2N-ET unverified, server T2OTHER\r\n").await;

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "serverid");
    }

    #[tokio::test]
    async fn default_filter_adjunct_fails() {
        let addr = fake_server(
            "# logresp APRS2N-ET unverified, server T2FINLAND adjunct \"filter default\" filter\r\n",
        )
        .await;

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "defaultfilter");
    }

    #[tokio::test]
    async fn connection_refused_is_a_socket_error() {
        // Bind to get a port that is then closed again.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let e = probe(addr.ip(), addr.port(), "T2FINLAND").await.unwrap_err();
        assert_eq!(e.code, "socket");
    }

    #[test]
    fn hubs_are_probed_on_their_peering_port() {
        assert_eq!(port_for("T2HUB1"), HUB_PORT);
        assert_eq!(port_for("T2FINLAND"), PORT);
    }
}
