//! Test doubles and common utilities for contract tests
//!
//! - [`ScriptedLauncher`] starts processes that replay a fixed output script
//!   and count `terminate()` calls.
//! - [`MemoryDnsProvider`] keeps records in memory and logs every call with a
//!   monotonic sequence number, so call ordering is observable.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tunnel_core::traits::{
    DnsProvider, DnsRecord, LineStream, ProcessExit, ProcessLauncher, RecordSpec, RecordType,
    TunnelProcess,
};
use tunnel_core::{Error, LaunchCommand, Result};

/// A registration line the way the tunnel binary prints it
pub fn registered(index: u32, location: &str) -> String {
    format!(
        "2024-05-01T10:00:0{}Z INF Registered tunnel connection connIndex={} connection=7c1a{} event=0 ip=198.41.200.{} location={} protocol=quic",
        index, index, index, index, location
    )
}

/// The banner line carrying a quick tunnel URL
pub fn quick_url_banner(url: &str) -> String {
    format!("2024-05-01T10:00:00Z INF |  {}                       |", url)
}

enum Step {
    Line(String),
    Sleep(Duration),
}

/// Output and exit behavior of one scripted process
#[derive(Default)]
pub struct Script {
    steps: Vec<Step>,
    exit: Option<i32>,
    spawn_error: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit one output line
    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.steps.push(Step::Line(line.into()));
        self
    }

    /// Pause before the next step
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Sleep(duration));
        self
    }

    /// Exit with `code` after the last step (otherwise run until terminated)
    pub fn exit(mut self, code: i32) -> Self {
        self.exit = Some(code);
        self
    }

    /// Fail to start at all
    pub fn spawn_error() -> Self {
        Self {
            spawn_error: true,
            ..Self::default()
        }
    }
}

/// Launcher that hands out scripted processes in order
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    starts: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
    commands: Mutex<Vec<LaunchCommand>>,
}

impl ScriptedLauncher {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            starts: Arc::new(AtomicUsize::new(0)),
            terminations: Arc::new(AtomicUsize::new(0)),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn single(script: Script) -> Self {
        Self::new([script])
    }

    /// Number of processes started
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `terminate()` calls across all processes
    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Commands passed to `start`, in order
    pub fn commands(&self) -> Vec<LaunchCommand> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn start(&self, command: &LaunchCommand) -> Result<Box<dyn TunnelProcess>> {
        self.commands.lock().unwrap().push(command.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script left for this start");

        if script.spawn_error {
            return Err(Error::spawn(format!(
                "{}: No such file or directory",
                command.program.display()
            )));
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedProcess::spawn(
            script,
            Arc::clone(&self.terminations),
        )))
    }
}

/// A process replaying a [`Script`] on a background task
pub struct ScriptedProcess {
    output: Mutex<Option<LineStream>>,
    exit_tx: Arc<watch::Sender<Option<ProcessExit>>>,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedProcess {
    pub fn spawn(script: Script, terminations: Arc<AtomicUsize>) -> Self {
        let (line_tx, line_rx) = mpsc::channel(64);
        let (exit_tx, _) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        let task_exit = Arc::clone(&exit_tx);
        tokio::spawn(async move {
            let mut stopped = task_exit.subscribe();
            for step in script.steps {
                match step {
                    Step::Line(line) => {
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Step::Sleep(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = stopped.wait_for(Option::is_some) => return,
                        }
                    }
                }
            }

            match script.exit {
                Some(code) => {
                    task_exit.send_if_modified(|exit| {
                        if exit.is_some() {
                            return false;
                        }
                        *exit = Some(ProcessExit::code(code));
                        true
                    });
                }
                None => {
                    // Keep the output open until the process is stopped
                    let _ = stopped.wait_for(Option::is_some).await;
                }
            }
            drop(line_tx);
        });

        Self {
            output: Mutex::new(Some(Box::pin(ReceiverStream::new(line_rx)))),
            exit_tx,
            terminations,
        }
    }
}

#[async_trait]
impl TunnelProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn take_output(&mut self) -> Option<LineStream> {
        self.output.get_mut().unwrap().take()
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_tx.subscribe()
    }

    async fn terminate(&self) -> Result<Option<ProcessExit>> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.exit_tx.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(ProcessExit::signal(15));
            true
        });
        Ok(*self.exit_tx.borrow())
    }
}

/// Provider operations, for the call log and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ZoneId,
    List,
    Create,
    Update,
    Delete,
}

/// One logged provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub seq: u64,
    pub op: Op,
    /// Record ID for update/delete, record name otherwise
    pub target: String,
    /// Content written by create/update
    pub content: Option<String>,
}

/// Failure injected into the next call of an operation
#[derive(Debug, Clone)]
pub enum Failure {
    RateLimited(Option<Duration>),
    ServerError,
    Authorization,
    CrossAccount,
    NotFound,
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Failure::RateLimited(retry_after) => Error::rate_limited("429 Too Many Requests", retry_after),
            Failure::ServerError => Error::http("502 Bad Gateway", Some(502)),
            Failure::Authorization => Error::auth("Invalid API token"),
            Failure::CrossAccount => Error::cross_account("1014: CNAME Cross-User Banned"),
            Failure::NotFound => Error::not_found("Record does not exist"),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<DnsRecord>,
    next_id: u64,
    seq: u64,
    calls: Vec<Call>,
    failures: HashMap<Op, VecDeque<Failure>>,
}

/// In-memory DNS zone
pub struct MemoryDnsProvider {
    zone_suffix: String,
    zone_id: String,
    state: Mutex<MemoryState>,
}

impl MemoryDnsProvider {
    /// A provider managing the zone `zone_suffix`
    pub fn new(zone_suffix: &str) -> Self {
        Self {
            zone_suffix: zone_suffix.to_string(),
            zone_id: format!("zone-{}", zone_suffix),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone_id
    }

    /// Add a record directly, bypassing the call log
    pub fn seed(&self, record_type: RecordType, name: &str, content: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("seed-{}", state.next_id);
        state.records.push(DnsRecord {
            id: id.clone(),
            record_type,
            name: name.to_string(),
            content: content.to_string(),
            ttl: 1,
            proxied: true,
        });
        id
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: Op, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    /// Current records
    pub fn records(&self) -> Vec<DnsRecord> {
        self.state.lock().unwrap().records.clone()
    }

    /// Records at `name`
    pub fn records_named(&self, name: &str) -> Vec<DnsRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.name.eq_ignore_ascii_case(name))
            .collect()
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls of one operation
    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Create, update and delete calls
    pub fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c.op, Op::Create | Op::Update | Op::Delete))
            .count()
    }

    fn log(&self, op: Op, target: &str, content: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        let seq = state.seq;
        state.calls.push(Call {
            seq,
            op,
            target: target.to_string(),
            content: content.map(str::to_string),
        });
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DnsProvider for MemoryDnsProvider {
    async fn zone_id(&self, hostname: &str) -> Result<String> {
        self.log(Op::ZoneId, hostname, None)?;
        let hostname = hostname.to_lowercase();
        if hostname == self.zone_suffix || hostname.ends_with(&format!(".{}", self.zone_suffix)) {
            Ok(self.zone_id.clone())
        } else {
            Err(Error::zone_not_found(hostname))
        }
    }

    async fn list_records(&self, _zone_id: &str, name: &str) -> Result<Vec<DnsRecord>> {
        self.log(Op::List, name, None)?;
        Ok(self.records_named(name))
    }

    async fn create_record(&self, _zone_id: &str, record: &RecordSpec) -> Result<DnsRecord> {
        self.log(Op::Create, &record.name, Some(&record.content))?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let created = DnsRecord {
            id: format!("rec-{}", state.next_id),
            record_type: record.record_type.clone(),
            name: record.name.clone(),
            content: record.content.clone(),
            ttl: record.ttl,
            proxied: record.proxied,
        };
        state.records.push(created.clone());
        Ok(created)
    }

    async fn update_record(
        &self,
        _zone_id: &str,
        record_id: &str,
        record: &RecordSpec,
    ) -> Result<DnsRecord> {
        self.log(Op::Update, record_id, Some(&record.content))?;
        let mut state = self.state.lock().unwrap();
        let existing = state
            .records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| Error::not_found(record_id.to_string()))?;
        existing.record_type = record.record_type.clone();
        existing.name = record.name.clone();
        existing.content = record.content.clone();
        existing.ttl = record.ttl;
        existing.proxied = record.proxied;
        Ok(existing.clone())
    }

    async fn delete_record(&self, _zone_id: &str, record_id: &str) -> Result<()> {
        self.log(Op::Delete, record_id, None)?;
        let mut state = self.state.lock().unwrap();
        let before = state.records.len();
        state.records.retain(|r| r.id != record_id);
        if state.records.len() == before {
            return Err(Error::not_found(record_id.to_string()));
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
