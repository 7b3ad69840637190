//! SCPI signal generator.
//!
//! This module controls a signal generator through SCPI commands sent over a
//! raw TCP socket. Each command is followed by `*OPC?`, so that the generator
//! answers `1` once the command has taken effect.

use crate::device::Generator;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Default SCPI raw socket port.
pub const DEFAULT_PORT: u16 = 5025;

/// SCPI signal generator.
#[derive(Debug)]
pub struct ScpiGenerator {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl ScpiGenerator {
    /// Connects to a signal generator.
    ///
    /// The `timeout` applies to the connection and to each command.
    #[tracing::instrument(level = "debug")]
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<ScpiGenerator> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to generator at {host}:{port}"))?
            .with_context(|| format!("failed to connect to generator at {host}:{port}"))?;
        stream.set_nodelay(true)?;
        tracing::info!(host, port, "connected to signal generator");
        Ok(ScpiGenerator {
            stream: BufReader::new(stream),
            timeout,
        })
    }

    /// Sends a command and waits until the generator completes it.
    pub async fn command(&mut self, command: &str) -> Result<()> {
        tracing::debug!(command, "sending SCPI command");
        tokio::time::timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for generator to complete {command}"))?
    }

    async fn exchange(&mut self, command: &str) -> Result<()> {
        self.stream
            .get_mut()
            .write_all(format!("{command};*opc?\n").as_bytes())
            .await?;
        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            anyhow::bail!("connection closed by generator");
        }
        anyhow::ensure!(
            reply.trim() == "1",
            "unexpected generator reply to {command}: {}",
            reply.trim()
        );
        Ok(())
    }
}

impl Generator for ScpiGenerator {
    async fn set_frequency_hz(&mut self, frequency: f64) -> Result<()> {
        self.command(&format!("freq {frequency}")).await
    }

    async fn set_power_dbm(&mut self, power: f64) -> Result<()> {
        self.command(&format!("power {power} dbm")).await
    }

    async fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.command(if enabled { "outp on" } else { "outp off" })
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    // Acknowledges every command and forwards it to the test
    async fn serve(listener: TcpListener, commands: mpsc::UnboundedSender<String>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        while stream.read_line(&mut line).await.unwrap() > 0 {
            let command = line.trim_end().to_string();
            let reply = if command.ends_with(";*opc?") { "1\n" } else { "0\n" };
            commands.send(command).unwrap();
            stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            line.clear();
        }
    }

    #[tokio::test]
    async fn commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, tx));
        let mut generator = ScpiGenerator::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        generator.set_power_dbm(-5.0).await.unwrap();
        generator.set_output_enabled(true).await.unwrap();
        generator.set_frequency_hz(527343750.0).await.unwrap();
        generator.set_output_enabled(false).await.unwrap();
        let mut sent = Vec::new();
        for _ in 0..4 {
            sent.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            sent,
            [
                "power -5 dbm;*opc?",
                "outp on;*opc?",
                "freq 527343750;*opc?",
                "outp off;*opc?"
            ]
        );
    }

    #[tokio::test]
    async fn bad_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            stream.get_mut().write_all(b"0\n").await.unwrap();
        });
        let mut generator = ScpiGenerator::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(generator.set_output_enabled(true).await.is_err());
    }
}
