//! Program-wide message bus
//!
//! Every agent owns an unbounded inbox. Messages addressed to `user` or
//! `human` land in the transcript instead. The bus also tracks how many
//! agents are doing work and how many messages are in flight; once both
//! reach zero nothing can ever wake up again, so the bus closes and every
//! blocked receive returns `None`.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};

use super::error::{AgentError, AgentResult};
use super::state::PeerDescriptor;
use crate::interpreter::Value;

/// Addresses that belong to the human side of the conversation
pub const HUMAN_ADDRESSES: [&str; 2] = ["user", "human"];

/// Whether `address` names the human side
pub fn is_human(address: &str) -> bool {
    HUMAN_ADDRESSES
        .iter()
        .any(|human| human.eq_ignore_ascii_case(address))
}

/// A message between agents
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender id (or `user`)
    pub from: String,
    /// Recipient id
    pub to: String,
    /// Payload
    pub content: Value,
}

impl Message {
    /// Payload as a `{from, content}` dict for generated code
    pub fn to_value(&self) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert("from".to_string(), Value::Str(self.from.clone()));
        map.insert("content".to_string(), self.content.clone());
        Value::Dict(map)
    }
}

/// Kind of transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    /// A message addressed to the human
    Message,
    /// An agent announcing itself at begin-of-life
    Introduction,
}

/// Something the human side gets to see
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    /// Speaking agent
    pub from: String,
    /// Rendered text
    pub content: String,
    /// Entry kind
    pub kind: TranscriptKind,
}

struct Mailbox {
    sender: mpsc::UnboundedSender<Message>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    deferred: Mutex<VecDeque<Message>>,
}

impl Mailbox {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    fn take_deferred(&self, source: Option<&str>) -> Option<Message> {
        let mut deferred = self.deferred.lock();
        let position = deferred
            .iter()
            .position(|message| accepts(source, message))?;
        deferred.remove(position)
    }
}

fn accepts(source: Option<&str>, message: &Message) -> bool {
    source.is_none_or(|source| source == message.from)
}

/// Keeps the bus from closing while it is alive
pub struct ActivityGuard {
    bus: Arc<MessageBus>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.bus.agent_stopped();
    }
}

/// Mailboxes, transcript, and quiescence detection
pub struct MessageBus {
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    active: AtomicUsize,
    in_flight: AtomicUsize,
    shutdown_when_idle: bool,
    closed: watch::Sender<bool>,
}

impl MessageBus {
    /// Create a bus
    pub fn new(shutdown_when_idle: bool) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            transcript: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            shutdown_when_idle,
            closed,
        }
    }

    /// Create an inbox for an agent (idempotent)
    pub fn register_mailbox(&self, agent_id: &str) {
        self.mailboxes
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new()));
    }

    fn mailbox(&self, agent_id: &str) -> AgentResult<Arc<Mailbox>> {
        self.mailboxes
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
    }

    /// An agent task started doing work
    pub fn agent_started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// An agent task finished
    pub fn agent_stopped(&self) {
        self.release();
    }

    /// Count as active until the guard drops
    pub fn hold(self: &Arc<Self>) -> ActivityGuard {
        self.agent_started();
        ActivityGuard { bus: self.clone() }
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.check_idle();
    }

    fn check_idle(&self) {
        if !self.shutdown_when_idle {
            return;
        }
        // in_flight first: a receiver marks itself active before it takes a
        // message out of flight.
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let active = self.active.load(Ordering::SeqCst);
        if in_flight == 0 && active == 0 && !self.is_closed() {
            tracing::info!("all agents are waiting and no message is in flight; closing bus");
            self.close();
        }
    }

    /// Deliver a message. Human recipients go to the transcript.
    pub fn send(&self, message: Message) -> AgentResult<()> {
        if is_human(&message.to) {
            self.record(TranscriptEntry {
                from: message.from,
                content: message.content.to_string(),
                kind: TranscriptKind::Message,
            });
            return Ok(());
        }

        let mailbox = self.mailbox(&message.to)?;
        tracing::debug!(from = %message.from, to = %message.to, "message sent");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if mailbox.sender.send(message).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Wait for the next message for `agent_id`, optionally only from
    /// `source`. Messages from other senders are kept for later receives.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn receive(&self, agent_id: &str, source: Option<&str>) -> AgentResult<Option<Message>> {
        let mailbox = self.mailbox(agent_id)?;
        if let Some(message) = mailbox.take_deferred(source) {
            return Ok(Some(message));
        }

        let mut inbox = mailbox.receiver.lock().await;
        let mut closed = self.closed.subscribe();
        self.release();

        loop {
            if *closed.borrow_and_update() {
                self.agent_started();
                return Ok(None);
            }

            tokio::select! {
                received = inbox.recv() => {
                    self.agent_started();
                    let Some(message) = received else {
                        return Ok(None);
                    };
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    if accepts(source, &message) {
                        return Ok(Some(message));
                    }
                    tracing::debug!(agent = agent_id, from = %message.from, "deferring message from another sender");
                    mailbox.deferred.lock().push_back(message);
                    self.release();
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        self.agent_started();
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Publish a begin-of-life introduction
    pub fn introduce(&self, agent: &PeerDescriptor, description: &str) {
        let content = if description.is_empty() {
            format!("{} is here", agent)
        } else {
            format!("{}: {}", agent, description)
        };
        self.record(TranscriptEntry {
            from: agent.id.clone(),
            content,
            kind: TranscriptKind::Introduction,
        });
    }

    fn record(&self, entry: TranscriptEntry) {
        tracing::info!(from = %entry.from, kind = ?entry.kind, "{}", entry.content);
        self.transcript.lock().push(entry);
    }

    /// Everything the human side has seen so far
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().clone()
    }

    /// Introductions published by `agent_id`
    pub fn introductions(&self, agent_id: &str) -> usize {
        self.transcript
            .lock()
            .iter()
            .filter(|entry| entry.kind == TranscriptKind::Introduction && entry.from == agent_id)
            .count()
    }

    /// Close the bus; pending and future receives return `None`
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether the bus is closed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
