//! Stdio transport of the runner process
//!
//! The host writes envelopes to our stdin, one per line; we answer on
//! stdout. Stdout carries nothing but envelopes, so logging goes to stderr.

use futures::{SinkExt, StreamExt};
use std::backtrace::Backtrace;
use std::io::Write;
use std::panic::PanicHookInfo;
use storyrun_common::store::{Environment, ForwardFilter};
use storyrun_common::{ChildMessage, Envelope, Error, ErrorLike, Result, Stores};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

/// Outbound half of the stdio transport
pub struct Transport {
    outbound: mpsc::UnboundedSender<Envelope>,
    forwarders: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Start forwarding locally produced store messages to `writer`
    pub fn start<W>(stores: &Stores, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(writer, rx);
        let forwarders = stores
            .channels()
            .iter()
            .map(|channel| {
                channel.spawn_forwarder(ForwardFilter::OnlyOrigin(Environment::Runner), outbound.clone())
            })
            .collect();
        Self {
            outbound,
            forwarders,
            writer,
        }
    }

    /// Tell the host the runner is ready to take commands
    pub fn announce_ready(&self) -> Result<()> {
        self.send(Envelope::ready())
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .map_err(|_| Error::ChannelClosed("stdout".into()))
    }

    /// Stop forwarding and flush what is already queued
    pub async fn shutdown(self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        drop(self.outbound);
        let _ = self.writer.await;
    }
}

fn spawn_writer<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedWrite::new(writer, LinesCodec::new());
        while let Some(envelope) = rx.recv().await {
            let line = match envelope.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!("Dropping unserializable envelope: {}", e);
                    continue;
                }
            };
            trace!("-> {}", line);
            if let Err(e) = lines.send(line).await {
                warn!("Failed to write to the host: {}", e);
                break;
            }
        }
    })
}

/// Apply envelopes arriving on `reader` until it reaches end of file
pub async fn read_loop<R>(reader: R, stores: &Stores) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| Error::Protocol(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        trace!("<- {}", line);
        if let Err(e) = apply_line(&line, stores) {
            warn!("Ignoring inbound line: {}", e);
        }
    }
    debug!("Host closed stdin");
    Ok(())
}

fn apply_line(line: &str, stores: &Stores) -> Result<()> {
    match Envelope::from_line(line)?.classify()? {
        ChildMessage::Channel { name, events } => {
            let channel = stores.channel(&name)?;
            for event in events {
                channel.apply_wire(event)?;
            }
        }
        ChildMessage::Other { kind, .. } => debug!("Unhandled host event: {}", kind),
        ChildMessage::Ready | ChildMessage::UncaughtError(_) => {
            warn!("Unexpected lifecycle message from the host")
        }
    }
    Ok(())
}

/// Report panics to the host as an uncaught error, then exit
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let error = panic_error(info);
        eprintln!("{}", error);
        if let Ok(line) = Envelope::uncaught_error(&error).to_line() {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
        std::process::exit(1);
    }));
}

fn panic_error(info: &PanicHookInfo<'_>) -> ErrorLike {
    let payload = info.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Box<dyn Any>".to_string());
    let mut error = ErrorLike::new("panic", message);
    let location = info
        .location()
        .map(|l| format!("at {}:{}:{}\n", l.file(), l.line(), l.column()))
        .unwrap_or_default();
    error.stack = Some(format!("{}{}", location, Backtrace::force_capture()));
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyrun_common::store::{RunStateEvent, StoreMessage, RUN_STATE_CHANNEL};
    use storyrun_common::{ProviderState, RunRequest, WireChannel};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_inbound_channel_messages_are_applied() {
        let host = Stores::new(Environment::Server);
        let runner = Stores::new(Environment::Runner);
        let mut sub = runner.run_state.subscribe();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = host
            .run_state
            .spawn_forwarder(ForwardFilter::ExceptOrigin(Environment::Runner), tx);
        host.run_state.send(RunStateEvent::TriggerRun(RunRequest::global()));
        let line = rx.recv().await.unwrap().to_line().unwrap();
        forwarder.abort();

        let input = format!("{}\n\nnot json\n{{\"type\":\"custom\",\"args\":[1]}}\n", line);
        read_loop(input.as_bytes(), &runner).await.unwrap();

        let delivered = sub.recv().await.unwrap();
        assert_eq!(
            delivered.message,
            StoreMessage::Event(RunStateEvent::TriggerRun(RunRequest::global()))
        );
        assert_eq!(delivered.info.actor.environment, Environment::Server);
    }

    #[tokio::test]
    async fn test_only_local_messages_are_written() {
        let runner = Stores::new(Environment::Runner);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let transport = Transport::start(&runner, ours);
        transport.announce_ready().unwrap();

        // Echo of a host message must not go back out
        let host = Stores::new(Environment::Server);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = host
            .run_state
            .spawn_forwarder(ForwardFilter::ExceptOrigin(Environment::Runner), tx);
        host.run_state.send(RunStateEvent::CancelRun);
        let echo = rx.recv().await.unwrap().to_line().unwrap();
        forwarder.abort();
        apply_line(&echo, &runner).unwrap();

        runner.provider.set_state(|s| *s = ProviderState::Running);
        tokio::task::yield_now().await;

        let mut lines = BufReader::new(theirs).lines();
        let first = Envelope::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.classify().unwrap(), ChildMessage::Ready);

        let second = Envelope::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.from.as_deref(), Some("runner"));
        match second.classify().unwrap() {
            ChildMessage::Channel { name, events } => {
                assert_ne!(name, RUN_STATE_CHANNEL);
                assert_eq!(events[0].event["body"], "running");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_lines() {
        let runner = Stores::new(Environment::Runner);
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let transport = Transport::start(&runner, ours);
        transport
            .send(Envelope::event("storyrun/ping", vec![serde_json::json!(1)]))
            .unwrap();
        transport.shutdown().await;

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut theirs, &mut output)
            .await
            .unwrap();
        assert_eq!(output, "{\"type\":\"storyrun/ping\",\"args\":[1]}\n");
    }
}
