//! In-memory executor for session tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::executor::{ExecOutput, RemoteCommand, RemoteExecutor, TransportError};
use crate::model::HostTarget;

type Scripted = Result<ExecOutput, TransportError>;

/// Answers commands by resource key from a per-key script.
///
/// Each key replays its responses in order and then repeats the last one.
/// A gated key holds its answer until the gate is notified.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<RemoteCommand>>,
    connect: Mutex<Option<TransportError>>,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, key: &str, output: &str, exit_code: i32) {
        self.push(key, Ok(ExecOutput::new(output, exit_code)));
    }

    pub(crate) fn fail(&self, key: &str, err: TransportError) {
        self.push(key, Err(err));
    }

    pub(crate) fn fail_connect(&self, err: TransportError) {
        *lock(&self.connect) = Some(err);
    }

    /// Hold answers for `key` until the returned gate is notified once per call.
    pub(crate) fn gate(&self, key: &str) -> Arc<Notify> {
        Arc::clone(lock(&self.gates).entry(key.to_string()).or_default())
    }

    pub(crate) fn calls(&self) -> Vec<RemoteCommand> {
        lock(&self.calls).clone()
    }

    pub(crate) fn call_count(&self, key: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|command| command.key == key)
            .count()
    }

    fn push(&self, key: &str, response: Scripted) {
        lock(&self.responses)
            .entry(key.to_string())
            .or_default()
            .push_back(response);
    }

    fn next_response(&self, key: &str) -> Scripted {
        let mut responses = lock(&self.responses);
        let Some(queue) = responses.get_mut(key) else {
            return Err(TransportError::Spawn(format!("no scripted response for {key}")));
        };
        if queue.len() > 1 {
            queue
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Spawn(key.to_string())))
        } else {
            queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Spawn(key.to_string())))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn connect(&self, _host: &HostTarget, _timeout: Duration) -> Result<(), TransportError> {
        match lock(&self.connect).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        _host: &HostTarget,
        command: &RemoteCommand,
        _timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        lock(&self.calls).push(command.clone());
        let gate = lock(&self.gates).get(&command.key).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.next_response(&command.key)
    }
}
