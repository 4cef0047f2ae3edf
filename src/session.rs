use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::signal;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, info, warn};

use crate::protocol::message::{self, Message};
use crate::transport::{Received, Transport};

/// how often the command loop wakes up to observe the running flag
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// backoff after an empty receive, so a suppressed datagram receive does not
/// spin while a send owns the socket
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// The authentication-gated command interpreter and top-level state machine:
/// `Unauthenticated -> Authenticated -> Terminated`.
///
/// Two tasks cooperate for the session's lifetime: the foreground command
/// loop polling operator input, and the background receiver draining the
/// transport. They share only the two atomic flags and the display name; the
/// transport serializes its own socket access internally.
pub struct Session {
    transport: Arc<dyn Transport>,
    authenticated: AtomicBool,
    running: AtomicBool,
    display_name: RwLock<String>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Session> {
        Arc::new(Session {
            transport,
            authenticated: AtomicBool::new(false),
            running: AtomicBool::new(true),
            display_name: RwLock::new(String::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Runs the session to completion: spawns the receiver task, drives the
    /// command loop on this task, and joins the receiver before returning.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let receiver = {
            let session = self.clone();
            tokio::spawn(async move { session.recv_loop().await })
        };

        self.command_loop().await;
        self.stop().await;
        receiver.await?;
        Ok(())
    }

    async fn command_loop(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while self.is_running() {
            let line = select! {
                _ = signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
                line = time::timeout(INPUT_POLL_INTERVAL, lines.next_line()) => line,
            };
            match line {
                Err(_elapsed) => continue,
                Ok(Ok(Some(line))) => self.handle_line(&line).await,
                Ok(Ok(None)) => {
                    debug!("end of operator input");
                    break;
                }
                Ok(Err(e)) => {
                    warn!("failed to read operator input: {}", e);
                    break;
                }
            }
        }
    }

    /// One line of operator input: empty lines are ignored, `/`-prefixed
    /// lines go to the command interpreter, anything else is chat content
    /// (only accepted once authenticated).
    pub async fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        if line.starts_with('/') {
            self.handle_command(line).await;
        } else if !self.is_authenticated() {
            println!("ERROR: Not authenticated.");
        } else {
            let display_name = self.display_name.read().await.clone();
            match Message::msg(&display_name, line) {
                Ok(msg) => self.send_or_stop(msg).await,
                Err(e) => println!("ERROR: {}", e),
            }
        }
    }

    async fn handle_command(&self, line: &str) {
        let mut args = line.split_whitespace();
        let cmd = args.next().unwrap_or("");

        if cmd == "/help" {
            print_help();
            return;
        }

        if !self.is_authenticated() {
            if cmd != "/auth" {
                println!("ERROR: You need to authenticate first...");
                return;
            }
            match (args.next(), args.next(), args.next()) {
                (Some(username), Some(secret), Some(display_name)) => {
                    match Message::auth(username, display_name, secret) {
                        Ok(msg) => {
                            *self.display_name.write().await = display_name.to_string();
                            self.send_or_stop(msg).await;
                        }
                        Err(e) => println!("ERROR: {}", e),
                    }
                }
                _ => println!("ERROR: Invalid /auth parameters."),
            }
            return;
        }

        match cmd {
            "/join" => match args.next() {
                Some(channel) => {
                    let display_name = self.display_name.read().await.clone();
                    match Message::join(channel, &display_name) {
                        Ok(msg) => self.send_or_stop(msg).await,
                        Err(e) => println!("ERROR: {}", e),
                    }
                }
                None => println!("ERROR: Invalid /join parameters."),
            },
            "/rename" => match args.next() {
                Some(display_name) => match message::validate_display_name(display_name) {
                    Ok(()) => *self.display_name.write().await = display_name.to_string(),
                    Err(e) => println!("ERROR: {}", e),
                },
                None => println!("ERROR: Invalid /rename parameters."),
            },
            "/auth" => println!("ERROR: You are already authenticated..."),
            _ => println!("ERROR: Unknown command '{}', use /help for available commands.", cmd),
        }
    }

    async fn recv_loop(&self) {
        while self.is_running() {
            match self.transport.receive().await {
                Ok(Received::Idle) => time::sleep(IDLE_BACKOFF).await,
                Ok(Received::Closed) => {
                    debug!("transport closed, ending receive loop");
                    self.running.store(false, Ordering::Release);
                    self.transport.stop().await;
                    break;
                }
                Ok(Received::Message(msg)) => self.handle_incoming(msg).await,
                Err(e) => {
                    if !self.is_running() {
                        // expected race between the socket closing and a
                        // concurrent shutdown
                        break;
                    }
                    warn!("failed to process inbound message: {}", e);
                    println!("ERROR: Invalid message.");
                    self.send_protocol_error("Invalid message").await;
                    self.stop().await;
                    break;
                }
            }
        }
    }

    /// Applies one decoded inbound message to the session state and renders
    /// it for the operator.
    pub async fn handle_incoming(&self, msg: Message) {
        if let Some(rendering) = render_incoming(&msg) {
            println!("{}", rendering);
        }

        match msg {
            Message::Reply { success, .. } => {
                if success && !self.authenticated.swap(true, Ordering::AcqRel) {
                    info!("authenticated");
                }
            }
            Message::Err { .. } | Message::Bye { .. } => {
                debug!("server terminated the session");
                self.stop().await;
            }
            Message::Msg { .. } | Message::Ping => {}
            other => debug!(?other, "ignoring unexpected inbound message"),
        }
    }

    /// Best-effort outbound ERR before a termination caused by a malformed
    /// inbound frame.
    async fn send_protocol_error(&self, content: &str) {
        let display_name = self.display_name.read().await.clone();
        match Message::err(&display_name, content) {
            Ok(msg) => {
                if let Err(e) = self.transport.send(msg).await {
                    warn!("failed to send ERR: {}", e);
                }
            }
            Err(e) => debug!("not sending ERR: {}", e),
        }
    }

    async fn send_or_stop(&self, msg: Message) {
        if let Err(e) = self.transport.send(msg).await {
            warn!("send failed: {}", e);
            println!("ERROR: Failed to send message.");
            self.stop().await;
        }
    }

    /// Shutdown sequence: flip the running flag, send a best-effort BYE if
    /// authenticated, close the transport. Safe to invoke from either task
    /// and more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("shutting down session");

        if self.is_authenticated() {
            let display_name = self.display_name.read().await.clone();
            match Message::bye(&display_name) {
                Ok(bye) => {
                    if let Err(e) = self.transport.send(bye).await {
                        warn!("failed to send BYE: {}", e);
                    }
                }
                Err(e) => warn!("not sending BYE: {}", e),
            }
        }
        self.transport.stop().await;
    }
}

/// Operator-visible rendering of inbound messages; `None` for messages that
/// have no operator representation.
fn render_incoming(msg: &Message) -> Option<String> {
    match msg {
        Message::Msg { display_name, content } => Some(format!("{}: {}", display_name, content)),
        Message::Reply { success: true, content, .. } => {
            Some(format!("Action Success: {}", content))
        }
        Message::Reply { success: false, content, .. } => {
            Some(format!("Action Failure: {}", content))
        }
        Message::Err { display_name, content } => {
            Some(format!("ERROR FROM {}: {}", display_name, content))
        }
        _ => None,
    }
}

fn print_help() {
    println!(
        "Available commands:\n\
         /auth <username> <secret> <displayName> - Authenticate user\n\
         /join <channelID> - Join a channel\n\
         /rename <displayName> - Change display name\n\
         /help - Show this help message"
    );
}
