use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::time;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::core::error::{EnqueueError, SessionError};
use crate::core::packet::{
    read_packet, write_packet, CodecError, Connack, Connect, ConnectReturnCode, LastWill, Packet,
    Publish, QoS, Suback, SubackCode, Subscribe, Unsubscribe,
};
use crate::core::session::{Job, Outbox, SessionContext, SessionHandle, SessionId};
use crate::core::topics::filter;
use crate::metrics::Stats;

/// Upper bound on flushing queued replies after teardown. A writer stuck on
/// a peer that stopped reading is aborted, which drops the transport.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives one client transport to completion.
///
/// Returns `Ok(())` on graceful DISCONNECT and the terminating error
/// otherwise. Cleanup has already run by the time this returns.
pub async fn run_session<S>(
    stream: S,
    peer: impl Into<String>,
    id: SessionId,
    ctx: SessionContext,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Connection::new(stream, peer, id, ctx).run().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Connected,
    Closing,
    Closed,
}

enum Flow {
    Continue,
    Stop,
}

/// Why the writer task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    /// Wrote a broker-initiated DISCONNECT.
    Kicked,
    Failed,
    Stopped,
}

/// Reader half of a session plus the state it owns.
pub struct Connection<S> {
    id: SessionId,
    peer: String,
    ctx: SessionContext,
    state: State,
    reader: ReadHalf<S>,
    outbox: Outbox,
    writer: Option<Writer<WriteHalf<S>>>,
    writer_exit: oneshot::Receiver<WriterExit>,
    stop: watch::Sender<bool>,
    handle: Option<SessionHandle>,
    will: Option<LastWill>,
    keep_alive: Option<Duration>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>, id: SessionId, ctx: SessionContext) -> Self {
        let (reader, io) = tokio::io::split(stream);
        let (outbox, jobs) = Outbox::channel(ctx.settings.send_queue_length);
        let (stop, stop_rx) = watch::channel(false);
        let (exit_tx, writer_exit) = oneshot::channel();

        let writer = Writer {
            io,
            jobs,
            stop: stop_rx,
            exit: Some(exit_tx),
            stats: Arc::clone(&ctx.stats),
            dump: ctx.settings.dump,
        };

        Self {
            id,
            peer: peer.into(),
            ctx,
            state: State::AwaitingHandshake,
            reader,
            outbox,
            writer: Some(writer),
            writer_exit,
            stop,
            handle: None,
            will: None,
            keep_alive: None,
        }
    }

    pub async fn run(mut self) -> Result<(), SessionError> {
        self.ctx.stats.client_connected();
        let writer = self
            .writer
            .take()
            .map(|w| tokio::spawn(w.run().instrument(Span::current())));

        let outcome = self.run_inner().await;
        self.teardown(&outcome);

        let _ = self.stop.send(true);
        if let Some(mut writer) = writer {
            match time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "writer task ended abnormally"),
                Err(_) => {
                    debug!("writer stalled on a peer that is not reading; aborting it");
                    writer.abort();
                }
            }
        }

        self.log_outcome(&outcome);
        outcome
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        loop {
            let packet = self.next_packet().await?;
            if self.ctx.settings.dump {
                debug!(?packet, "received");
            }
            self.ctx.stats.message_received();

            if let Flow::Stop = self.dispatch(packet).await? {
                return Ok(());
            }
        }
    }

    /// Reads the next packet, bounded by the keepalive interval once one is
    /// known. A writer exit (takeover or write failure) ends the read early.
    async fn next_packet(&mut self) -> Result<Packet, SessionError> {
        let max = self.ctx.settings.max_packet_size;
        let keep_alive = self.keep_alive;
        let read = read_packet(&mut self.reader, max);

        tokio::select! {
            biased;
            exit = &mut self.writer_exit => Err(match exit {
                Ok(WriterExit::Kicked) => SessionError::TakenOver,
                Ok(WriterExit::Failed | WriterExit::Stopped) | Err(_) => SessionError::WriterFailed,
            }),
            read = with_deadline(keep_alive, read) => read,
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<Flow, SessionError> {
        match (self.state, packet) {
            (State::AwaitingHandshake, Packet::Connect(connect)) => {
                self.handle_connect(connect).await?;
                Ok(Flow::Continue)
            }
            (State::AwaitingHandshake, other) => Err(violation(format!(
                "{} before CONNECT",
                other.packet_type()
            ))),

            (State::Connected, Packet::Connect(_)) => Err(violation("second CONNECT")),
            (State::Connected, Packet::Publish(publish)) => self.handle_publish(publish),
            (State::Connected, Packet::Puback(_) | Packet::Pubcomp(_)) => Ok(Flow::Continue),
            (State::Connected, Packet::Pubrec(id)) => Ok(self.reply(Packet::Pubrel(id))),
            (State::Connected, Packet::Pubrel(id)) => Ok(self.reply(Packet::Pubcomp(id))),
            (State::Connected, Packet::Subscribe(subscribe)) => self.handle_subscribe(subscribe),
            (State::Connected, Packet::Unsubscribe(unsubscribe)) => {
                self.handle_unsubscribe(unsubscribe)
            }
            (State::Connected, Packet::Pingreq) => Ok(self.reply(Packet::Pingresp)),
            (State::Connected, Packet::Disconnect) => Ok(Flow::Stop),
            (
                State::Connected,
                other @ (Packet::Connack(_)
                | Packet::Suback(_)
                | Packet::Unsuback(_)
                | Packet::Pingresp),
            ) => Err(violation(format!(
                "server-only {} sent by client",
                other.packet_type()
            ))),

            (State::Closing | State::Closed, other) => Err(violation(format!(
                "{} after close",
                other.packet_type()
            ))),
        }
    }

    async fn handle_connect(&mut self, mut connect: Connect) -> Result<(), SessionError> {
        if let Some(will) = &connect.will {
            if !filter::is_valid_topic(&will.topic) {
                return Err(violation(format!("will on invalid topic {:?}", will.topic)));
            }
        }

        let mut code = connect.validate();
        if code == ConnectReturnCode::Accepted {
            code = self.ctx.authenticator.authenticate(&connect);
        }
        if code != ConnectReturnCode::Accepted {
            self.reply(Packet::Connack(Connack {
                session_present: false,
                code,
            }));
            return Err(SessionError::HandshakeRejected(code));
        }

        if connect.client_id.is_empty() {
            connect.client_id = generated_client_id();
        }
        self.keep_alive = (connect.keep_alive > 0)
            .then(|| Duration::from_secs(u64::from(connect.keep_alive)));
        self.will = connect.will.take();

        let handle = SessionHandle::new(self.id, connect.client_id.clone(), self.outbox.clone());
        self.reply(Packet::Connack(Connack {
            session_present: false,
            code,
        }));
        self.state = State::Connected;

        let displaced = self.ctx.registry.register(handle.clone());
        if let Some(previous) = displaced {
            Self::take_over(self.ctx.settings.takeover_timeout, previous).await;
        }
        self.handle = Some(handle);

        info!(
            "New client connected from {} as {} (c{}, k{}).",
            self.peer,
            connect.client_id,
            u8::from(connect.clean_session),
            connect.keep_alive
        );
        Ok(())
    }

    /// Forces the previous holder of our client id off and waits, bounded, for
    /// its writer to flush the DISCONNECT.
    ///
    /// No `&self` here: a borrow held across the await makes the session
    /// future `!Send`.
    async fn take_over(limit: Duration, previous: SessionHandle) {
        info!(
            replaced = %previous.id(),
            "Client {} already connected, closing old connection.",
            previous.client_id()
        );

        let receipt = match previous.outbox().submit_sync(Packet::Disconnect).await {
            Ok(receipt) => receipt,
            Err(_) => {
                debug!(replaced = %previous.id(), "previous session already closed");
                return;
            }
        };

        if !receipt.wait_timeout(limit).await {
            error!(
                client_id = %previous.client_id(),
                replaced = %previous.id(),
                "previous session did not acknowledge forced disconnect within {:?}",
                limit
            );
        }
    }

    fn handle_publish(&self, publish: Publish) -> Result<Flow, SessionError> {
        if !filter::is_valid_topic(&publish.topic) {
            return Err(violation(format!(
                "PUBLISH to invalid topic {:?}",
                publish.topic
            )));
        }

        let source = Some(self.id);
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => self.ctx.router.submit(source, publish),
            (QoS::AtLeastOnce, Some(id)) => {
                self.ctx.router.submit(source, publish);
                self.reply(Packet::Puback(id));
            }
            (QoS::ExactlyOnce, Some(id)) => {
                self.reply(Packet::Pubrec(id));
                self.ctx.router.submit(source, publish);
            }
            (_, None) => return Err(violation("PUBLISH above QoS 0 without packet id")),
        }
        Ok(Flow::Continue)
    }

    fn handle_subscribe(&self, subscribe: Subscribe) -> Result<Flow, SessionError> {
        let handle = self.session()?;
        let router = &self.ctx.router;

        let codes: Vec<SubackCode> = subscribe
            .filters
            .iter()
            .map(|(topic_filter, qos)| {
                if filter::is_valid_filter(topic_filter) {
                    router.add(topic_filter, *qos, handle);
                    SubackCode::Granted(*qos)
                } else {
                    warn!(filter = %topic_filter, "rejecting invalid subscription filter");
                    SubackCode::Failure
                }
            })
            .collect();

        self.reply(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            codes: codes.clone(),
        }));

        for ((topic_filter, _), code) in subscribe.filters.iter().zip(&codes) {
            if let SubackCode::Granted(_) = code {
                router.send_retain(topic_filter, handle);
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<Flow, SessionError> {
        let handle = self.session()?;
        for topic_filter in &unsubscribe.filters {
            self.ctx.router.unsub(topic_filter, handle.id());
        }
        Ok(self.reply(Packet::Unsuback(unsubscribe.packet_id)))
    }

    fn session(&self) -> Result<&SessionHandle, SessionError> {
        self.handle
            .as_ref()
            .ok_or_else(|| violation("no registered session"))
    }

    /// Queues a protocol reply on our own outbox. Replies are dropped rather
    /// than awaited when the queue is full.
    fn reply(&self, packet: Packet) -> Flow {
        let packet_type = packet.packet_type();
        match self.outbox.submit(packet) {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                warn!(%packet_type, "outbound queue full; dropping reply")
            }
            Err(EnqueueError::Closed) => debug!(%packet_type, "writer gone; dropping reply"),
        }
        Flow::Continue
    }

    fn teardown(&mut self, outcome: &Result<(), SessionError>) {
        self.state = State::Closing;

        if outcome.is_err() {
            if let Some(will) = self.will.take() {
                debug!(topic = %will.topic, "publishing last will");
                self.ctx.router.submit(Some(self.id), will.into_publish());
            }
        }

        if let Some(handle) = &self.handle {
            self.ctx.router.unsub_all(handle.id());
            self.ctx.registry.unregister(handle.client_id(), handle.id());
        }
        self.ctx.stats.client_disconnected();
        self.state = State::Closed;
    }

    fn log_outcome(&self, outcome: &Result<(), SessionError>) {
        let client = self
            .handle
            .as_ref()
            .map_or(self.peer.as_str(), |h| h.client_id());

        match outcome {
            Ok(()) => info!("Client {} disconnected.", client),
            Err(SessionError::KeepaliveTimeout(_)) => {
                info!("Client {} has exceeded timeout, disconnecting.", client)
            }
            Err(SessionError::TakenOver) => {
                info!("Client {} was taken over by a newer connection.", client)
            }
            Err(SessionError::HandshakeRejected(code)) => {
                info!("Connection refused for {}: {}.", self.peer, code)
            }
            Err(e) if e.is_eof() => info!("Socket error on client {}, disconnecting.", client),
            Err(SessionError::ProtocolViolation(reason)) => {
                warn!(reason = %reason, "Client {} violated the protocol, disconnecting.", client)
            }
            Err(e) => warn!(error = %e, "Client {} disconnected with error.", client),
        }
    }
}

/// Owns the write half and the session's single outbound queue consumer.
struct Writer<W> {
    io: W,
    jobs: flume::Receiver<Job>,
    stop: watch::Receiver<bool>,
    exit: Option<oneshot::Sender<WriterExit>>,
    stats: Arc<Stats>,
    dump: bool,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                job = self.jobs.recv_async() => match job {
                    Ok(job) => {
                        if let Some(exit) = self.write(job).await {
                            break exit;
                        }
                    }
                    Err(_) => break WriterExit::Stopped,
                },
                _ = self.stop.changed() => {
                    self.flush_queued().await;
                    break WriterExit::Stopped;
                }
            }
        };

        // dropping unsent jobs resolves their receipts
        self.jobs.drain().for_each(drop);
        if let Err(e) = self.io.shutdown().await {
            debug!(error = %e, "transport shutdown failed");
        }
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(exit);
        }
    }

    async fn flush_queued(&mut self) {
        while let Ok(job) = self.jobs.try_recv() {
            if self.write(job).await.is_some() {
                return;
            }
        }
    }

    /// Writes one job and signals its receipt. Returns `Some` when the writer
    /// must stop.
    async fn write(&mut self, job: Job) -> Option<WriterExit> {
        let (packet, receipt) = job.into_parts();
        if self.dump {
            debug!(?packet, "sending");
        }

        let result = write_packet(&mut self.io, &packet).await;
        if let Some(receipt) = receipt {
            let _ = receipt.send(());
        }

        match result {
            Ok(()) => {
                self.stats.message_sent();
                matches!(packet, Packet::Disconnect).then_some(WriterExit::Kicked)
            }
            Err(CodecError::Io(e)) => {
                debug!(error = %e, "write failed");
                Some(WriterExit::Failed)
            }
            Err(e) => {
                warn!(error = %e, packet_type = %packet.packet_type(), "dropping unencodable packet");
                None
            }
        }
    }
}

async fn with_deadline<F>(limit: Option<Duration>, read: F) -> Result<Packet, SessionError>
where
    F: std::future::Future<Output = Result<Packet, CodecError>>,
{
    match limit {
        Some(limit) => time::timeout(limit, read)
            .await
            .map_err(|_| SessionError::KeepaliveTimeout(limit))?
            .map_err(SessionError::from),
        None => read.await.map_err(SessionError::from),
    }
}

fn violation(reason: impl Into<String>) -> SessionError {
    SessionError::ProtocolViolation(reason.into())
}

fn generated_client_id() -> String {
    format!("blipmqtt-{}", Uuid::new_v4().simple())
}
