//! KATCP client.
//!
//! This module implements the subset of the Karoo Array Telescope Control
//! Protocol that is needed to access the registers and BRAMs of a ROACH board.
//! KATCP is a line-based ASCII protocol. Requests start with `?`, replies with
//! `!` and informs (unsolicited or intermediate messages) with `#`. Binary
//! arguments are escaped so that they do not contain whitespace.

use crate::device::Registers;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Default KATCP TCP port.
pub const DEFAULT_PORT: u16 = 7147;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// KATCP client.
///
/// The client keeps a TCP connection to the board. Requests are sent one at a
/// time, and each waits for its reply before returning.
///
/// A request that times out leaves its reply pending in the connection, so
/// after a timeout every further request fails. A new client must be
/// connected.
#[derive(Debug)]
pub struct KatcpClient {
    stream: BufReader<TcpStream>,
    timeout: Duration,
    desynchronized: bool,
}

impl KatcpClient {
    /// Connects to a KATCP server.
    ///
    /// The `timeout` applies to the connection and to each request. After
    /// connecting, a `?watchdog` request is sent to check that the server
    /// answers.
    #[tracing::instrument(level = "debug")]
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<KatcpClient> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {host}:{port}"))?
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        stream.set_nodelay(true)?;
        let mut client = KatcpClient {
            stream: BufReader::new(stream),
            timeout,
            desynchronized: false,
        };
        client
            .watchdog()
            .await
            .with_context(|| format!("KATCP server at {host}:{port} not responding"))?;
        tracing::info!(host, port, "connected to KATCP server");
        Ok(client)
    }

    /// Pings the server.
    pub async fn watchdog(&mut self) -> Result<()> {
        self.request("watchdog", &[]).await?;
        Ok(())
    }

    /// Sends a request and waits for its reply.
    ///
    /// The arguments are escaped before sending them. On success, the
    /// unescaped arguments of the reply that follow `ok` are returned. A reply
    /// with any other status is an error.
    pub async fn request(&mut self, name: &str, args: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        anyhow::ensure!(
            !self.desynchronized,
            "KATCP connection unusable after a previous request timed out"
        );
        let mut line = format!("?{name}").into_bytes();
        for arg in args {
            line.push(b' ');
            line.extend_from_slice(&escape(arg));
        }
        line.push(b'\n');
        tracing::trace!(name, "sending KATCP request");
        let reply = tokio::time::timeout(self.timeout, self.exchange(name, &line)).await;
        match reply {
            Ok(result) => result,
            Err(_) => {
                self.desynchronized = true;
                anyhow::bail!("timed out waiting for reply to ?{name}")
            }
        }
    }

    async fn exchange(&mut self, name: &str, request: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.stream.get_mut().write_all(request).await?;
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.stream.read_until(b'\n', &mut line).await? == 0 {
                anyhow::bail!("connection closed by KATCP server");
            }
            let mut words = line
                .split(|&c| matches!(c, b' ' | b'\t' | b'\n' | b'\r'))
                .filter(|w| !w.is_empty());
            let Some(command) = words.next() else {
                continue;
            };
            match command.split_first() {
                Some((b'#', inform)) => {
                    tracing::trace!(inform = %String::from_utf8_lossy(inform), "KATCP inform");
                }
                Some((b'!', reply)) if reply == name.as_bytes() => {
                    let status = words.next().unwrap_or_default();
                    let args = words.map(unescape).collect::<Result<Vec<_>>>()?;
                    if status != b"ok" {
                        let message = args
                            .iter()
                            .map(|a| String::from_utf8_lossy(a))
                            .collect::<Vec<_>>()
                            .join(" ");
                        anyhow::bail!(
                            "?{name} failed: {} {message}",
                            String::from_utf8_lossy(status)
                        );
                    }
                    return Ok(args);
                }
                _ => anyhow::bail!(
                    "unexpected KATCP message: {}",
                    String::from_utf8_lossy(&line).trim_end()
                ),
            }
        }
    }
}

impl Registers for KatcpClient {
    async fn read_bytes(&mut self, name: &str, len: usize, offset: usize) -> Result<Bytes> {
        let mut reply = self
            .request(
                "read",
                &[
                    name.as_bytes(),
                    offset.to_string().as_bytes(),
                    len.to_string().as_bytes(),
                ],
            )
            .await?;
        anyhow::ensure!(!reply.is_empty(), "?read reply carries no data");
        Ok(Bytes::from(reply.swap_remove(0)))
    }

    async fn write_bytes(&mut self, name: &str, data: &[u8], offset: usize) -> Result<()> {
        self.request(
            "write",
            &[name.as_bytes(), offset.to_string().as_bytes(), data],
        )
        .await?;
        Ok(())
    }

    async fn write_int(&mut self, name: &str, value: i32) -> Result<()> {
        let data = value.to_be_bytes();
        self.write_bytes(name, &data, 0).await?;
        let readback = self.read_bytes(name, data.len(), 0).await?;
        anyhow::ensure!(
            readback[..] == data[..],
            "verification of register {name} failed: wrote {value}, read back {readback:?}"
        );
        Ok(())
    }

    async fn read_int(&mut self, name: &str) -> Result<i32> {
        let data = self.read_bytes(name, 4, 0).await?;
        let data: [u8; 4] = data[..]
            .try_into()
            .with_context(|| format!("register {name} read returned {} bytes", data.len()))?;
        Ok(i32::from_be_bytes(data))
    }
}

/// Escapes a KATCP argument.
///
/// Backslash, space, NUL, newline, carriage return, escape and tab are replaced
/// by `\\`, `\_`, `\0`, `\n`, `\r`, `\e` and `\t`. The empty argument is
/// encoded as `\@`.
pub fn escape(arg: &[u8]) -> Vec<u8> {
    if arg.is_empty() {
        return b"\\@".to_vec();
    }
    let mut escaped = Vec::with_capacity(arg.len());
    for &c in arg {
        let code = match c {
            b'\\' => b'\\',
            b' ' => b'_',
            0 => b'0',
            b'\n' => b'n',
            b'\r' => b'r',
            0x1b => b'e',
            b'\t' => b't',
            _ => {
                escaped.push(c);
                continue;
            }
        };
        escaped.extend_from_slice(&[b'\\', code]);
    }
    escaped
}

/// Unescapes a KATCP argument.
///
/// This is the inverse of [`escape`]. Unknown escape sequences are an error.
pub fn unescape(arg: &[u8]) -> Result<Vec<u8>> {
    if arg == b"\\@" {
        return Ok(Vec::new());
    }
    let mut unescaped = Vec::with_capacity(arg.len());
    let mut bytes = arg.iter();
    while let Some(&c) = bytes.next() {
        if c != b'\\' {
            unescaped.push(c);
            continue;
        }
        unescaped.push(match bytes.next() {
            Some(b'\\') => b'\\',
            Some(b'_') => b' ',
            Some(b'0') => 0,
            Some(b'n') => b'\n',
            Some(b'r') => b'\r',
            Some(b'e') => 0x1b,
            Some(b't') => b'\t',
            Some(&other) => anyhow::bail!("invalid KATCP escape \\{}", char::from(other)),
            None => anyhow::bail!("KATCP argument ends with a backslash"),
        });
    }
    Ok(unescaped)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    #[test]
    fn escaping() {
        let raw = b"a b\\c\0d\ne\rf\x1bg\th";
        let escaped = escape(raw);
        assert_eq!(&escaped[..], &b"a\\_b\\\\c\\0d\\ne\\rf\\eg\\th"[..]);
        assert!(!escaped.iter().any(|c| c.is_ascii_whitespace()));
        assert_eq!(unescape(&escaped).unwrap(), raw.to_vec());
        assert_eq!(escape(b""), b"\\@".to_vec());
        assert_eq!(unescape(b"\\@").unwrap(), Vec::<u8>::new());
        assert!(unescape(b"ab\\").is_err());
        assert!(unescape(b"\\x").is_err());
    }

    // Minimal ROACH lookalike: serves ?watchdog, ?read and ?write from memory
    async fn serve(listener: TcpListener, mut memory: HashMap<String, Vec<u8>>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        while stream.read_line(&mut line).await.unwrap() > 0 {
            let words: Vec<&str> = line.split_whitespace().collect();
            let reply = match words[..] {
                ["?watchdog"] => "!watchdog ok\n".to_string(),
                ["?read", name, offset, len] => match memory.get(name) {
                    Some(data) => {
                        let offset: usize = offset.parse().unwrap();
                        let len: usize = len.parse().unwrap();
                        let data = escape(&data[offset..offset + len]);
                        format!(
                            "#log info 0 read\\_request\n!read ok {}\n",
                            String::from_utf8(data).unwrap()
                        )
                    }
                    None => "!read fail no\\_such\\_device\n".to_string(),
                },
                ["?write", name, offset, data] => {
                    let offset: usize = offset.parse().unwrap();
                    let data = unescape(data.as_bytes()).unwrap();
                    let memory = memory.entry(name.to_string()).or_default();
                    memory.resize(memory.len().max(offset + data.len()), 0);
                    memory[offset..offset + data.len()].copy_from_slice(&data);
                    "!write ok\n".to_string()
                }
                _ => "!unknown fail\n".to_string(),
            };
            stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            line.clear();
        }
    }

    async fn client(memory: HashMap<String, Vec<u8>>) -> KatcpClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, memory));
        KatcpClient::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn read_write() {
        let memory = HashMap::from([("bram".to_string(), vec![b' ', b'\n', 0, 7, b'\\', 9])]);
        let mut client = client(memory).await;
        let data = client.read_bytes("bram", 4, 1).await.unwrap();
        assert_eq!(&data[..], &[b'\n', 0, 7, b'\\']);

        client.write_int("adc0_delay", -3).await.unwrap();
        assert_eq!(client.read_int("adc0_delay").await.unwrap(), -3);
        client.write_bytes("bram", b"\t\t", 0).await.unwrap();
        let data = client.read_bytes("bram", 6, 0).await.unwrap();
        assert_eq!(&data[..], &[b'\t', b'\t', 0, 7, b'\\', 9]);
    }

    #[tokio::test]
    async fn failed_request() {
        let mut client = client(HashMap::new()).await;
        let err = client.read_bytes("missing", 4, 0).await.unwrap_err();
        assert!(format!("{err}").contains("no such device"));
    }

    #[tokio::test]
    async fn late_reply_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // answers ?watchdog at once and ?read only after 500 ms
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            while stream.read_line(&mut line).await.unwrap() > 0 {
                if line.starts_with("?read") {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    stream.get_mut().write_all(b"!read ok old\n").await.unwrap();
                } else {
                    stream.get_mut().write_all(b"!watchdog ok\n").await.unwrap();
                }
                line.clear();
            }
        });
        let mut client = KatcpClient::connect("127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(client.read_bytes("bram", 3, 0).await.is_err());
        // let the late reply arrive
        tokio::time::sleep(Duration::from_millis(600)).await;
        let err = client.read_bytes("bram", 3, 0).await.unwrap_err();
        assert!(format!("{err}").contains("unusable"));
        assert!(client.watchdog().await.is_err());
    }

    #[tokio::test]
    async fn request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // accepts the connection but never answers
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let result = KatcpClient::connect("127.0.0.1", port, Duration::from_millis(100)).await;
        assert!(result.is_err());
        server.abort();
    }
}
