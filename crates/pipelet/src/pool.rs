//! Executor slot pool.
//!
//! One tokio task per slot, each bound to its own pipe channel, all sharing
//! the worker context. Slots are independent: a fatal error stops that slot
//! only and is logged, never hidden behind a respawn. Lifecycle is
//! Created -> Running -> Draining -> Stopped, observable through a watch
//! channel.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bridge::channel::{PipeChannel, ReadOutcome};
use crate::bridge::command::{self, Command};
use crate::context::WorkerContext;
use crate::error::{FatalError, TaskFailure};
use crate::message;
use crate::task::executor::{TaskExecutor, TaskOutcome};
use crate::task::spec::ParamType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool requires at least one slot channel")]
    NoSlots,

    #[error("pool already started")]
    AlreadyStarted,
}

/// Why a slot loop ended.
enum SlotExit {
    Drained,
    Closed,
    Fatal(FatalError),
}

pub struct ExecutorPool {
    ctx: Arc<WorkerContext>,
    state: watch::Sender<PoolState>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ExecutorPool {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let (state, _) = watch::channel(PoolState::Created);
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            state,
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PoolState> {
        self.state.subscribe()
    }

    /// Spawn one slot per channel. The pool starts exactly once.
    pub fn start(&mut self, channels: Vec<PipeChannel>) -> Result<(), PoolError> {
        if self.state() != PoolState::Created {
            return Err(PoolError::AlreadyStarted);
        }
        if channels.is_empty() {
            return Err(PoolError::NoSlots);
        }

        let _ = self.state.send(PoolState::Running);
        tracing::info!(slots = channels.len(), "Executor pool running");

        for channel in channels {
            let slot = SlotId::new();
            let ctx = Arc::clone(&self.ctx);
            let state = self.state.clone();
            let mut shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(async move {
                let exit = slot_loop(slot, ctx, channel, &state, &mut shutdown).await;
                match exit {
                    SlotExit::Drained => tracing::info!(%slot, "Slot drained"),
                    SlotExit::Closed => tracing::info!(%slot, "Slot pipe closed by peer"),
                    SlotExit::Fatal(e) => {
                        tracing::error!(%slot, error = %e, "Slot stopped on fatal error");
                    }
                }
            }));
        }
        Ok(())
    }

    /// Ask every slot to stop once its current command finishes.
    pub fn shutdown(&self) {
        self.state.send_if_modified(|s| {
            if *s == PoolState::Running {
                *s = PoolState::Draining;
                true
            } else {
                false
            }
        });
        let _ = self.shutdown.send(true);
    }

    /// Wait for all slots to finish, then mark the pool stopped.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Slot task aborted");
            }
        }
        let _ = self.state.send(PoolState::Stopped);
        tracing::info!("Executor pool stopped");
    }
}

async fn slot_loop(
    slot: SlotId,
    ctx: Arc<WorkerContext>,
    mut channel: PipeChannel,
    state: &watch::Sender<PoolState>,
    shutdown: &mut watch::Receiver<bool>,
) -> SlotExit {
    let executor = TaskExecutor::new(Arc::clone(&ctx));
    loop {
        // Shutdown is only observed between commands; an in-flight task
        // always runs to completion.
        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => return SlotExit::Drained,
            read = channel.read_command() => read,
        };

        let line = match read {
            Ok(ReadOutcome::Line(line)) => line,
            Ok(ReadOutcome::Malformed(e)) => {
                tracing::warn!(%slot, error = %e, "Discarded undecodable input");
                if let Err(e) = channel.write_response(&command::error_response(&e.to_string())).await {
                    return SlotExit::Fatal(e);
                }
                continue;
            }
            Ok(ReadOutcome::Closed) => return SlotExit::Closed,
            Err(e) => return SlotExit::Fatal(e),
        };

        let cmd = match Command::parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(%slot, error = %e, "Rejected command");
                if let Err(e) = channel.write_response(&command::error_response(&e.to_string())).await {
                    return SlotExit::Fatal(e);
                }
                continue;
            }
        };

        match cmd {
            Command::Ping => {
                if let Err(e) = channel.write_response(command::TAG_PONG).await {
                    return SlotExit::Fatal(e);
                }
            }
            Command::Quit => {
                // First QUIT anywhere moves the pool to Draining; this slot
                // acknowledges and stops, the others keep serving until told.
                state.send_if_modified(|s| {
                    if *s == PoolState::Running {
                        *s = PoolState::Draining;
                        true
                    } else {
                        false
                    }
                });
                if let Err(e) = channel.write_response(command::TAG_QUIT).await {
                    return SlotExit::Fatal(e);
                }
                return SlotExit::Drained;
            }
            Command::Remove { identifier } => {
                ctx.cache().invalidate(&identifier);
                if let Err(e) = channel.write_response(command::TAG_ACK).await {
                    return SlotExit::Fatal(e);
                }
            }
            Command::ExecuteTask(spec) => {
                let outcome = match executor.execute(&spec).await {
                    Ok(outcome) => outcome,
                    Err(fatal) => return SlotExit::Fatal(fatal),
                };
                let response = match render_outcome(&outcome) {
                    Ok(line) => line,
                    Err(fatal) => return SlotExit::Fatal(fatal),
                };
                if let Err(e) = channel.write_response(&response).await {
                    return SlotExit::Fatal(e);
                }
                if let Err(e) = channel
                    .write_response(&outcome.exit_code().to_string())
                    .await
                {
                    return SlotExit::Fatal(e);
                }
            }
        }
    }
}

/// Response line for one task: success yields its (type, value) pairs,
/// failure yields one OBJECT pair carrying the error message.
fn render_outcome(outcome: &TaskOutcome) -> Result<String, FatalError> {
    match outcome {
        TaskOutcome::Success { types, values } => message::build_return_message(types, values),
        TaskOutcome::Failure(failure) => failure_message(failure),
    }
}

fn failure_message(failure: &TaskFailure) -> Result<String, FatalError> {
    let token = message::encode_error_value(&failure.to_string());
    message::build_return_message(&[ParamType::Object], &[token])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{WorkerConfig, WorkerContext};
    use crate::registry::TaskRegistry;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex, split};

    struct Peer {
        writer: tokio::io::WriteHalf<DuplexStream>,
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("response within timeout")
                .unwrap()
                .expect("open pipe")
        }

        async fn task_response(&mut self, line: &str) -> (Vec<(ParamType, String)>, String) {
            self.send(line).await;
            let message = message::parse_return_message(&self.recv().await).unwrap();
            let code = self.recv().await;
            (message, code)
        }
    }

    fn channels(n: usize) -> (Vec<PipeChannel>, Vec<Peer>) {
        let mut slots = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..n {
            let (ours, theirs) = duplex(16 * 1024);
            let (r, w) = split(ours);
            slots.push(PipeChannel::new(r, w));
            let (pr, pw) = split(theirs);
            peers.push(Peer {
                writer: pw,
                lines: BufReader::new(pr).lines(),
            });
        }
        (slots, peers)
    }

    fn worker_context(seed: &[(&str, serde_json::Value)]) -> (Arc<WorkerContext>, Arc<MemoryStore>) {
        let registry = TaskRegistry::builder()
            .register("demo.inc", |_ctx, args| {
                let n = args[0].as_i64().ok_or("not a number")?;
                args[0] = serde_json::json!(n + 1);
                Ok(vec![])
            })
            .register("demo.add", |_ctx, args| {
                let a = args[0].as_i64().ok_or("not a number")?;
                let b = args[1].as_i64().ok_or("not a number")?;
                Ok(vec![serde_json::json!(a + b)])
            })
            .register("demo.slow_merge", |_ctx, args| {
                let n = args[0].as_i64().ok_or("not a number")?;
                std::thread::sleep(Duration::from_millis(25));
                args[0] = serde_json::json!(n + 1);
                Ok(vec![])
            })
            .build();
        let store = Arc::new(MemoryStore::new());
        for (id, value) in seed {
            store.insert_value(id, value);
        }
        let ctx = WorkerContext::new(registry, store.clone(), WorkerConfig::default());
        (ctx, store)
    }

    #[tokio::test]
    async fn ping_pong() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        let (slots, mut peers) = channels(1);
        pool.start(slots).unwrap();

        peers[0].send("PING").await;
        assert_eq!(peers[0].recv().await, "PONG");
    }

    #[tokio::test]
    async fn malformed_line_does_not_kill_the_slot() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        let (slots, mut peers) = channels(1);
        pool.start(slots).unwrap();
        let peer = &mut peers[0];

        peer.send("FROBNICATE x y").await;
        let err = peer.recv().await;
        assert!(err.starts_with("ERROR "));
        assert_eq!(err.split_whitespace().count(), 2);

        // Truncated EXECUTE_TASK is also recoverable.
        peer.send("EXECUTE_TASK demo.add 2 OBJECT r x 1 1").await;
        assert!(peer.recv().await.starts_with("ERROR "));

        let (message, code) = peer
            .task_response("EXECUTE_TASK demo.add 2 OBJECT r a 2 OBJECT r b 3 1")
            .await;
        assert_eq!(code, "0");
        assert_eq!(
            message::decode_return_value(&message[2].1).unwrap(),
            serde_json::json!(5)
        );
    }

    #[tokio::test]
    async fn inout_chain_accumulates_through_store() {
        let (ctx, store) = worker_context(&[("d1v1", serde_json::json!(100))]);
        let mut pool = ExecutorPool::new(Arc::clone(&ctx));
        let (slots, mut peers) = channels(1);
        pool.start(slots).unwrap();
        let peer = &mut peers[0];

        for step in 1..=3 {
            let (_, code) = peer
                .task_response("EXECUTE_TASK demo.inc 1 OBJECT r+ v @d1v1 0")
                .await;
            assert_eq!(code, "0");
            // Between calls: the write-back invalidated the entry, so no
            // stale copy (and no leaked pin) survives to the next task.
            assert!(ctx.cache().len() <= 1);
            assert!(!ctx.cache().contains("d1v1"));
            assert_eq!(store.get_value("d1v1"), Some(serde_json::json!(100 + step)));
        }
    }

    #[tokio::test]
    async fn failed_task_reports_message_and_code() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        let (slots, mut peers) = channels(1);
        pool.start(slots).unwrap();

        let (message, code) = peers[0]
            .task_response("EXECUTE_TASK no.such 0 0")
            .await;
        assert_eq!(code, "3");
        assert_eq!(message.len(), 1);
        assert_eq!(message[0].0, ParamType::Object);
        let text = message::decode_return_value(&message[0].1).unwrap();
        assert!(text.as_str().unwrap().contains("no.such"));
    }

    #[tokio::test]
    async fn remove_invalidates_cached_entry() {
        let (ctx, store) = worker_context(&[("d7v1", serde_json::json!(1))]);
        let mut pool = ExecutorPool::new(Arc::clone(&ctx));
        let (slots, mut peers) = channels(1);
        pool.start(slots).unwrap();
        let peer = &mut peers[0];

        let (_, code) = peer
            .task_response("EXECUTE_TASK demo.add 2 OBJECT r a @d7v1 OBJECT r b 1 1")
            .await;
        assert_eq!(code, "0");
        assert!(ctx.cache().contains("d7v1"));

        peer.send("REMOVE d7v1").await;
        assert_eq!(peer.recv().await, "ACK");
        assert!(!ctx.cache().contains("d7v1"));

        // The next task sees the store's current value, not a stale copy.
        store.insert_value("d7v1", &serde_json::json!(40));
        let (message, _) = peer
            .task_response("EXECUTE_TASK demo.add 2 OBJECT r a @d7v1 OBJECT r b 2 1")
            .await;
        assert_eq!(
            message::decode_return_value(&message[2].1).unwrap(),
            serde_json::json!(42)
        );
    }

    #[tokio::test]
    async fn commutative_tasks_exclude_across_slots() {
        let (ctx, store) = worker_context(&[("acc", serde_json::json!(0))]);
        let mut pool = ExecutorPool::new(Arc::clone(&ctx));
        let (slots, mut peers) = channels(2);
        pool.start(slots).unwrap();

        let line = "EXECUTE_TASK demo.slow_merge 1 OBJECT cv acc @acc 0";
        let mut a = peers.remove(0);
        let mut b = peers.remove(0);
        let (ra, rb) = tokio::join!(a.task_response(line), b.task_response(line));
        assert_eq!(ra.1, "0");
        assert_eq!(rb.1, "0");

        // Serialized execution: neither increment is lost.
        assert_eq!(store.get_value("acc"), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn quit_drains_one_slot_and_flags_the_pool() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        let (slots, mut peers) = channels(2);
        pool.start(slots).unwrap();
        assert_eq!(pool.state(), PoolState::Running);

        peers[0].send("QUIT").await;
        assert_eq!(peers[0].recv().await, "QUIT");
        assert_eq!(pool.state(), PoolState::Draining);

        // The other slot still serves.
        peers[1].send("PING").await;
        assert_eq!(peers[1].recv().await, "PONG");
    }

    #[tokio::test]
    async fn shutdown_then_join_stops_the_pool() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        let (slots, peers) = channels(2);
        pool.start(slots).unwrap();

        pool.shutdown();
        assert_eq!(pool.state(), PoolState::Draining);
        pool.join().await;
        assert_eq!(pool.state(), PoolState::Stopped);
        drop(peers);
    }

    #[tokio::test]
    async fn pool_start_validations() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        assert!(matches!(pool.start(Vec::new()), Err(PoolError::NoSlots)));

        let (slots, _peers) = channels(1);
        pool.start(slots).unwrap();
        let (slots, _peers2) = channels(1);
        assert!(matches!(pool.start(slots), Err(PoolError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn peer_close_ends_the_slot() {
        let (ctx, _) = worker_context(&[]);
        let mut pool = ExecutorPool::new(ctx);
        let (slots, peers) = channels(1);
        pool.start(slots).unwrap();

        drop(peers);
        pool.join().await;
        assert_eq!(pool.state(), PoolState::Stopped);
    }
}
