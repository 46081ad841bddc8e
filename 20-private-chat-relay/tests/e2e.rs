use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_private_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("private_chat_relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;
    let url = format!("ws://{addr}/ws");

    // Drain additional relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let mut alice = spawn_client(&binary, "alice", &url).await?;
    alice.expect_line("*** Welcome, alice!").await?;
    alice.expect_line("*** online: alice").await?;

    let mut bob = spawn_client(&binary, "bob", &url).await?;
    bob.expect_line("*** Welcome, bob!").await?;
    bob.expect_line("*** online: alice, bob").await?;
    alice.expect_line("*** online: alice, bob").await?;

    // A second "alice" is turned away and its connection closed.
    let mut impostor = spawn_client(&binary, "alice", &url).await?;
    impostor.expect_line("*** Username already taken!").await?;
    impostor
        .expect_line("*** server closed the connection")
        .await?;
    // Closing stdin ends the pending read so the runtime can shut down.
    drop(impostor.stdin);
    ensure_success(&mut impostor.child, "impostor client").await?;

    // Alice messages Bob; Bob receives it and Alice gets the acknowledgement.
    alice
        .send_line("/msg bob hello bob")
        .await
        .context("alice send message")?;
    let received = bob.read_line("waiting for bob to receive").await?;
    let acknowledged = alice.read_line("waiting for alice acknowledgement").await?;
    let (received_at, received_text) = split_timestamp(&received)?;
    let (acknowledged_at, acknowledged_text) = split_timestamp(&acknowledged)?;
    assert_eq!(received_text, "<alice> hello bob");
    assert_eq!(acknowledged_text, "-> bob: hello bob");
    assert_eq!(received_at, acknowledged_at);

    // Unknown recipients only bother the sender.
    alice
        .send_line("/msg carol are you there")
        .await
        .context("alice send to carol")?;
    alice.expect_line("*** User carol not available").await?;

    bob.send_line("/typing alice").await.context("bob typing")?;
    alice.expect_line("*** bob is typing...").await?;

    // Bob quits; Alice sees the roster shrink.
    bob.send_line("/quit").await.context("bob send quit")?;
    bob.expect_line("*** leaving chat").await?;
    alice.expect_line("*** online: alice").await?;

    alice.send_line("/quit").await.context("alice send quit")?;
    alice.expect_line("*** leaving chat").await?;

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The relay stays up after clients disconnect; terminate it manually.
    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

#[tokio::test]
async fn serve_reports_an_address_in_use() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("private_chat_relay");
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = taken.local_addr()?;

    let output = timeout(
        READ_TIMEOUT,
        Command::new(binary)
            .arg("serve")
            .arg("--listen")
            .arg(addr.to_string())
            .env("RUST_LOG", "warn")
            .env("NO_COLOR", "1")
            .output(),
    )
    .await
    .context("relay did not exit")??;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!("failed to bind {addr}")),
        "unexpected stderr: {stderr}"
    );
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, description: &str) -> Result<String> {
        read_line_expect(&mut self.stdout, description).await
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = self
            .read_line(&format!("waiting for '{expected}'"))
            .await?;
        if line != expected {
            return Err(anyhow!("expected '{expected}', got '{line}'"));
        }
        Ok(())
    }
}

fn split_timestamp(line: &str) -> Result<(&str, &str)> {
    let rest = line
        .strip_prefix('[')
        .with_context(|| format!("missing timestamp in '{line}'"))?;
    rest.split_once("] ")
        .with_context(|| format!("unterminated timestamp in '{line}'"))
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "info")
        .env("RUST_LOG_STYLE", "never")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("relay did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, name: &str, url: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--server")
        .arg(url)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
