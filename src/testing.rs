//! Test doubles shared across module tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::watch;

use crate::anthropic::types::{ContentBlock, MessagesResponse, Usage};
use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::instance::{WorkerCommand, WorkerExit, WorkerLauncher, WorkerOutput, WorkerProcess};

/// Canned `MessageSender`: replies with queued texts in order, then errors.
pub(crate) struct MockClient {
    replies: Mutex<Vec<Result<String, u16>>>,
    pub(crate) requests: Mutex<Vec<MessagesRequest>>,
}

impl MockClient {
    pub(crate) fn ok(text: &str) -> Self {
        Self::sequence(vec![Ok(text.to_string())])
    }

    pub(crate) fn err(status: u16) -> Self {
        Self::sequence(vec![Err(status)])
    }

    pub(crate) fn sequence(mut replies: Vec<Result<String, u16>>) -> Self {
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSender for MockClient {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        self.requests.lock().unwrap().push(req.clone());
        match self.replies.lock().unwrap().pop() {
            Some(Ok(text)) => Ok(MessagesResponse {
                id: "mock".into(),
                content: vec![ContentBlock {
                    content_type: "text".into(),
                    text,
                }],
                model: "mock".into(),
                stop_reason: Some("end_turn".into()),
                usage: Usage {
                    input_tokens: 0,
                    output_tokens: 0,
                },
            }),
            Some(Err(status)) => Err(AnthropicError::ApiError {
                status,
                message: "mock error".into(),
            }),
            None => Err(AnthropicError::ApiError {
                status: 500,
                message: "no reply queued".into(),
            }),
        }
    }
}

/// In-memory worker whose exit is driven by the test.
pub(crate) struct ScriptedWorker {
    exit_tx: watch::Sender<Option<WorkerExit>>,
    /// Exit reported by `exit_status` only; `wait` never sees it.
    reaped: Mutex<Option<WorkerExit>>,
    kills: AtomicUsize,
    dies_on_kill: bool,
}

impl ScriptedWorker {
    fn new(dies_on_kill: bool) -> Self {
        Self {
            exit_tx: watch::Sender::new(None),
            reaped: Mutex::new(None),
            kills: AtomicUsize::new(0),
            dies_on_kill,
        }
    }

    pub(crate) fn exit(&self, exit: WorkerExit) {
        self.exit_tx.send_replace(Some(exit));
    }

    /// Exit that a status poll can observe before any waiter is woken.
    pub(crate) fn exit_unobserved(&self, exit: WorkerExit) {
        *self.reaped.lock().unwrap() = Some(exit);
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerProcess for ScriptedWorker {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn exit_status(&self) -> Option<WorkerExit> {
        let exited = *self.exit_tx.borrow();
        exited.or(*self.reaped.lock().unwrap())
    }

    fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }

    async fn wait(&self, timeout: Duration) -> Result<Option<WorkerExit>> {
        let mut rx = self.exit_tx.subscribe();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(Option::is_some).await.map(|exit| *exit)
        })
        .await;
        match settled {
            Err(_) => Ok(None),
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn kill(&self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.dies_on_kill && self.is_alive() {
            self.exit(WorkerExit::killed());
        }
        Ok(())
    }

    async fn drain_output(&self) -> Result<WorkerOutput> {
        Ok(WorkerOutput {
            stdout: String::new(),
            stderr: "scripted stderr".into(),
        })
    }
}

/// Launcher that records commands and hands out [`ScriptedWorker`]s.
#[derive(Default)]
pub(crate) struct ScriptedLauncher {
    commands: Mutex<Vec<WorkerCommand>>,
    workers: Mutex<Vec<Arc<ScriptedWorker>>>,
    fail: bool,
    stubborn: bool,
}

impl ScriptedLauncher {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Workers that ignore kill signals.
    pub(crate) fn stubborn() -> Self {
        Self {
            stubborn: true,
            ..Default::default()
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub(crate) fn command(&self, index: usize) -> WorkerCommand {
        self.commands.lock().unwrap()[index].clone()
    }

    pub(crate) fn worker(&self, index: usize) -> Arc<ScriptedWorker> {
        self.workers.lock().unwrap()[index].clone()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, command: &WorkerCommand) -> Result<Arc<dyn WorkerProcess>> {
        self.commands.lock().unwrap().push(command.clone());
        if self.fail {
            bail!("exec format error");
        }
        let worker = Arc::new(ScriptedWorker::new(!self.stubborn));
        self.workers.lock().unwrap().push(worker.clone());
        Ok(worker)
    }
}
