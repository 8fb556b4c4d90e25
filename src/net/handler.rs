//! Connection handler module
//!
//! Handles the lifecycle of a client connection:
//! - Session setup with a dedicated writer task
//! - Migrate-in, binding the connection to a character and placing it in its field
//! - Routing every later packet to the field the user currently stands in
//! - Cleanup: leaving the field, saving the character, removing the session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{FieldServerError, GameError, NetworkError, ProtocolError, Result};
use crate::game::field::{Dispatch, FieldObject, FieldUser};
use crate::net::buffer::PacketBuffer;
use crate::net::session::{Session, SessionState};
use crate::net::transport::{write_frame, FrameReader};
use crate::protocol::opcodes::RecvOperation;
use crate::AppState;

/// Outbound packets queued per connection before senders wait
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// How long the writer task may take to drain after the connection ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection handler for processing client connections
pub struct ConnectionHandler {
    /// Shared application state
    state: Arc<AppState>,
    /// Silence allowed before the connection is dropped
    idle_timeout: Duration,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(state: Arc<AppState>) -> Self {
        let idle_timeout = state.config.idle_timeout();
        Self {
            state,
            idle_timeout,
        }
    }

    /// Handle a TCP connection
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling TCP connection");

        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        self.handle_connection(reader, writer, addr).await
    }

    /// Drive one connection over any split byte stream
    pub async fn handle_connection<R, W>(&self, reader: R, writer: W, addr: SocketAddr) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_SIZE);
        let session = self
            .state
            .session_manager
            .create_session(addr, outbound_tx)?;

        let writer_task = tokio::spawn(run_writer(session.id, writer, outbound_rx));
        let writer_abort = writer_task.abort_handle();

        let mut reader = FrameReader::new(reader);
        let result = match self.migrate_in(&mut reader, &session).await {
            Ok(user) => {
                let result = self.process_packets(&mut reader, &session, &user).await;
                self.release_user(&user).await;
                result
            }
            Err(e) => Err(e),
        };

        debug!(session_id = session.id, "Connection handler ending");
        session.set_state(SessionState::Disconnected);
        self.state.session_manager.remove(session.id);
        drop(session);

        // The writer stops once every sender is gone
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task)
            .await
            .is_err()
        {
            trace!("Writer task did not drain in time");
            writer_abort.abort();
        }

        match result {
            Err(FieldServerError::Network(NetworkError::ConnectionClosed)) => {
                debug!(address = %addr, "Connection closed");
                Ok(())
            }
            Err(FieldServerError::Network(NetworkError::Timeout(idle))) => {
                info!(address = %addr, idle_secs = idle.as_secs(), "Dropping idle connection");
                Ok(())
            }
            other => other,
        }
    }

    /// Bind the connection to a character and place it in its field
    async fn migrate_in<R: AsyncRead + Unpin>(
        &self,
        reader: &mut FrameReader<R>,
        session: &Arc<Session>,
    ) -> Result<Arc<FieldUser>> {
        let payload = self.read_frame(reader, session).await?;
        let mut packet = PacketBuffer::from_bytes(&payload);
        let opcode = packet.read_u16()?;

        if RecvOperation::from_u16(opcode) != RecvOperation::MigrateIn {
            return Err(ProtocolError::UnexpectedPacket {
                state: session.state().name().to_string(),
                opcode,
            }
            .into());
        }

        let character_id = packet.read_i32()?;
        let character = self
            .state
            .characters
            .get(character_id)
            .ok_or(GameError::CharacterNotFound(character_id))?;

        self.state
            .session_manager
            .bind_character(session.id, character_id)?;
        let field = self.state.fields.get(character.field_id).await?;

        let user = FieldUser::new(session.clone(), character);
        field.enter(FieldObject::User(user.clone())).await?;
        session.set_state(SessionState::InGame);

        info!(
            session_id = session.id,
            character_id = character_id,
            field_id = field.id(),
            "Character migrated in"
        );

        Ok(user)
    }

    /// Read and dispatch packets until the connection ends
    async fn process_packets<R: AsyncRead + Unpin>(
        &self,
        reader: &mut FrameReader<R>,
        session: &Arc<Session>,
        user: &Arc<FieldUser>,
    ) -> Result<()> {
        loop {
            let payload = self.read_frame(reader, session).await?;

            let mut packet = PacketBuffer::from_bytes(&payload);
            let opcode = packet.read_u16()?;
            let operation = RecvOperation::from_u16(opcode);

            trace!(
                session_id = session.id,
                opcode = opcode,
                length = payload.len(),
                "Received packet"
            );

            let result = match user.field() {
                Some(field) => field.dispatch(user, operation, &mut packet).await,
                None => Err(GameError::NotInField(user.id()).into()),
            };

            match result {
                Ok(Dispatch::Handled) => {}
                Ok(Dispatch::Unhandled) => {
                    debug!(
                        session_id = session.id,
                        operation = ?operation,
                        "Unhandled operation"
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        session_id = session.id,
                        operation = ?operation,
                        error = %e,
                        "Error processing packet"
                    );
                }
            }
        }
    }

    /// Read the next frame, failing once the client has been silent too long
    async fn read_frame<R: AsyncRead + Unpin>(
        &self,
        reader: &mut FrameReader<R>,
        session: &Session,
    ) -> Result<Bytes> {
        loop {
            let remaining = self.idle_timeout.saturating_sub(session.idle_for());
            match tokio::time::timeout(remaining, reader.read_frame()).await {
                Ok(frame) => {
                    let frame = frame?;
                    session.touch();
                    return Ok(frame);
                }
                Err(_) if session.is_idle(self.idle_timeout) => {
                    return Err(NetworkError::Timeout(session.idle_for()).into());
                }
                // Partial frames stay buffered in the reader
                Err(_) => continue,
            }
        }
    }

    /// Take the user out of its field and persist the character
    async fn release_user(&self, user: &Arc<FieldUser>) {
        if let Some(field) = user.field() {
            field.leave(&FieldObject::User(user.clone())).await;
        }

        let character = user.character();
        debug!(
            character_id = character.id,
            field_id = character.field_id,
            "Releasing character"
        );
        self.state.characters.save(character);
    }
}

/// Drain the outbound queue into the socket
async fn run_writer<W>(session_id: u64, mut writer: W, mut outbound_rx: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = outbound_rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!(session_id = session_id, error = %e, "Write failed, closing writer");
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(session_id = session_id, error = %e, "Error during writer shutdown");
    }
}
