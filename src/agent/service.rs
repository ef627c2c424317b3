//! TCP endpoint that accepts coordinator commands.
//!
//! Every accepted connection becomes a session on its own thread: read one
//! command, run it, write one result, close. Sessions run in a reporting
//! [`ThreadGroup`], so a session that fails (for example on a malformed
//! command) is recorded in the agent's exception sink and closes without
//! a response.

use super::Agent;
use super::protocol::{self, Command};
use crate::error::Result;
use crate::thread_group::ThreadGroup;
use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a session waits for its command line.
const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Identifier session failures are reported under.
pub const SESSION_GROUP: &str = "agent-sessions";

/// Accept loop serving one [`Agent`].
pub struct CommandService {
    listener: TcpListener,
    agent: Arc<Agent>,
    sessions: ThreadGroup,
    shutdown: Arc<AtomicBool>,
}

impl CommandService {
    /// Bind to `addr`. Port 0 picks a free port; see [`Self::local_addr`].
    pub fn bind(addr: impl ToSocketAddrs, agent: Arc<Agent>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let sessions = ThreadGroup::reporting(SESSION_GROUP, Arc::clone(agent.exceptions()));
        Ok(Self {
            listener,
            agent,
            sessions,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Stop serving once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown flag is set, then wait for open sessions.
    pub fn serve(&self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Accepting commands");

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.start_session(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        tracing::info!("Shutdown requested, waiting for open sessions");
        self.sessions.await_completion()
    }

    fn start_session(&self, stream: TcpStream, peer: SocketAddr) {
        let agent = Arc::clone(&self.agent);
        let spawned = self
            .sessions
            .spawn("session", move |ctx| {
                let _frame = ctx.enter(format!("session with {}", peer));
                handle_session(&agent, stream, peer)
            });
        if let Err(e) = spawned {
            tracing::error!(%peer, error = %e, "Failed to start session thread");
        }
    }
}

/// One command, one result.
fn handle_session(agent: &Agent, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    // The listener is nonblocking; accepted sockets must not inherit that.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(SESSION_READ_TIMEOUT))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let command = match Command::read_from(&mut reader) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "Closing session without response");
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e);
        }
    };

    let service = command.service();
    tracing::debug!(%peer, service, "Command received");
    let result = agent.dispatch(command);

    let mut writer = stream;
    protocol::write_line(&mut writer, &result.to_line()?)?;
    let _ = writer.shutdown(Shutdown::Write);
    tracing::debug!(%peer, service, "Response sent");
    Ok(())
}
