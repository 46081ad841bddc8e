use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ClientFrame, ServerFrame, encode_frame},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Socket, Message>;
type Reader = SplitStream<Socket>;

const USAGE: &str = "*** commands: /msg <name> <text>, /typing <name>, /who, /quit";

/// A line typed by the user, already interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Frame(ClientFrame),
    Who,
    Quit,
    Usage,
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }

    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();
    match command.to_ascii_lowercase().as_str() {
        "/quit" => Input::Quit,
        "/who" => Input::Who,
        "/typing" if !rest.is_empty() => Input::Frame(ClientFrame::Typing {
            to: rest.to_string(),
        }),
        "/msg" => match rest.split_once(char::is_whitespace) {
            Some((to, message)) if !message.trim().is_empty() => {
                Input::Frame(ClientFrame::PrivateMessage {
                    to: to.to_string(),
                    message: message.trim().to_string(),
                })
            }
            _ => Input::Usage,
        },
        _ => Input::Usage,
    }
}

pub fn render_server_frame(frame: &ServerFrame) -> String {
    match frame {
        ServerFrame::System { message } => format!("*** {message}"),
        ServerFrame::UserList { users } => render_roster(users),
        ServerFrame::PrivateMessage {
            from,
            message,
            timestamp,
        } => format!("[{timestamp}] <{from}> {message}"),
        ServerFrame::Delivered {
            to,
            message,
            timestamp,
        } => format!("[{timestamp}] -> {to}: {message}"),
        ServerFrame::Typing { from } => format!("*** {from} is typing..."),
    }
}

fn render_roster(users: &[String]) -> String {
    if users.is_empty() {
        "*** online: nobody".to_string()
    } else {
        format!("*** online: {}", users.join(", "))
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (socket, _) = connect_async(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut writer, mut reader) = socket.split();
    send_frame(
        &mut writer,
        &ClientFrame::Login {
            username: args.name.clone(),
        },
    )
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut roster = Vec::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut roster).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn run_client_loop(
    reader: &mut Reader,
    writer: &mut Writer,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    roster: &mut Vec<String>,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = reader.next() => {
                if !handle_server_message(server_message, roster).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, roster).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tungstenite::Error>>,
    roster: &mut Vec<String>,
) -> Result<bool> {
    let text = match message {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        Some(Ok(_)) => return Ok(true),
        Some(Err(error)) => {
            warn!(?error, "connection to relay failed");
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    match serde_json::from_str::<ServerFrame>(&text) {
        Ok(frame) => {
            if let ServerFrame::UserList { users } = &frame {
                roster.clone_from(users);
            }
            write_stdout(&render_server_frame(&frame)).await?;
        }
        Err(error) => warn!(?error, "ignoring unreadable frame from relay"),
    }
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut Writer,
    roster: &[String],
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    match parse_input(input) {
        Input::Frame(frame) => send_frame(writer, &frame).await?,
        Input::Who => write_stdout(&render_roster(roster)).await?,
        Input::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Input::Usage => write_stdout(USAGE).await?,
        Input::Empty => {}
    }
    Ok(true)
}

async fn send_frame(writer: &mut Writer, frame: &ClientFrame) -> Result<()> {
    let text = encode_frame(frame)?;
    writer
        .send(Message::Text(text))
        .await
        .context("failed to send frame to relay")
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut Writer) {
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
