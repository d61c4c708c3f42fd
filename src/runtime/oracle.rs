//! Oracle seam
//!
//! An oracle turns a request (which agent, which workflow position, what went
//! wrong last time) into a stream of generated statement text. The stream is
//! consumed chunk by chunk by the incremental executor.

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use super::error::{OracleError, OracleResult};
use super::state::InstructionPointer;

/// Input for one oracle turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    /// Agent asking
    pub agent_id: String,
    /// Class of the agent
    pub agent_class: String,
    /// Current position of the top frame
    pub position: InstructionPointer,
    /// Rendered workflow steps
    pub instructions: String,
    /// Turn number within the frame, starting at 1
    pub turn: usize,
    /// Errors from the previous turn, for a corrective retry
    pub corrective: Vec<String>,
}

/// Source of generated statements
pub trait Oracle: Send + Sync {
    /// Stream the statements for one turn
    fn stream_turn(&self, request: &OracleRequest) -> BoxStream<'static, OracleResult<String>>;
}

/// Replays prepared turns.
///
/// Turns are queued per key; a request takes the next turn queued for its
/// agent id, falling back to its class. An exhausted queue yields an empty
/// turn, which ends the current frame.
pub struct ScriptedOracle {
    turns: Mutex<HashMap<String, VecDeque<String>>>,
    requests: Mutex<Vec<OracleRequest>>,
    chunk_size: usize,
}

impl ScriptedOracle {
    /// Empty script delivering whole turns as single chunks
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 0,
        }
    }

    /// Split every turn into chunks of `chunk_size` characters (0: no split)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Queue turns for an agent id or class
    pub fn script<I, S>(self, key: &str, turns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_turns(key, turns);
        self
    }

    /// Queue turns for an agent id or class
    pub fn push_turns<I, S>(&self, key: &str, turns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.turns
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(turns.into_iter().map(Into::into));
    }

    /// Parse a JSON script: `{"Buyer": ["turn one", "turn two"], "1001": [...]}`
    pub fn from_json(text: &str) -> OracleResult<Self> {
        let script: HashMap<String, Vec<String>> =
            serde_json::from_str(text).map_err(|e| OracleError::Script(e.to_string()))?;
        let oracle = Self::new();
        for (key, turns) in script {
            oracle.push_turns(&key, turns);
        }
        Ok(oracle)
    }

    /// Load a JSON script from disk
    pub fn from_file(path: &Path) -> OracleResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| OracleError::Script(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().clone()
    }

    /// Turns still queued under `key`
    pub fn remaining(&self, key: &str) -> usize {
        self.turns.lock().get(key).map_or(0, VecDeque::len)
    }

    fn next_turn(&self, request: &OracleRequest) -> Option<String> {
        let mut turns = self.turns.lock();
        for key in [&request.agent_id, &request.agent_class] {
            if let Some(turn) = turns.get_mut(key.as_str()).and_then(VecDeque::pop_front) {
                return Some(turn);
            }
        }
        None
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn split_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    if chunk_size == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

impl Oracle for ScriptedOracle {
    fn stream_turn(&self, request: &OracleRequest) -> BoxStream<'static, OracleResult<String>> {
        self.requests.lock().push(request.clone());
        match self.next_turn(request) {
            Some(turn) => {
                tracing::debug!(
                    agent = %request.agent_id,
                    position = %request.position,
                    bytes = turn.len(),
                    "scripted turn"
                );
                stream::iter(split_chunks(&turn, self.chunk_size).into_iter().map(Ok)).boxed()
            }
            None => stream::empty().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(agent_id: &str, class: &str) -> OracleRequest {
        OracleRequest {
            agent_id: agent_id.to_string(),
            agent_class: class.to_string(),
            position: InstructionPointer::new("Main", "01", 1),
            instructions: String::new(),
            turn: 1,
            corrective: Vec::new(),
        }
    }

    async fn collect(oracle: &ScriptedOracle, request: &OracleRequest) -> Vec<String> {
        oracle
            .stream_turn(request)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn agent_id_takes_precedence_over_class() {
        let oracle = ScriptedOracle::new()
            .script("Buyer", ["class turn\n"])
            .script("1001", ["agent turn\n"]);

        assert_eq!(collect(&oracle, &request("1001", "Buyer")).await, vec!["agent turn\n"]);
        assert_eq!(collect(&oracle, &request("1001", "Buyer")).await, vec!["class turn\n"]);
        assert!(collect(&oracle, &request("1001", "Buyer")).await.is_empty());
        assert_eq!(oracle.requests().len(), 3);
    }

    #[tokio::test]
    async fn turns_are_chunked_on_char_boundaries() {
        let oracle = ScriptedOracle::from_json(r#"{"Buyer": ["x = 'é'\n"]}"#)
            .unwrap()
            .with_chunk_size(3);
        let chunks = collect(&oracle, &request("1000", "Buyer")).await;
        assert_eq!(chunks.concat(), "x = 'é'\n");
        assert!(chunks.len() > 1);
        assert_eq!(oracle.remaining("Buyer"), 0);
    }

    #[test]
    fn malformed_script_is_reported() {
        assert!(matches!(
            ScriptedOracle::from_json("[1, 2]"),
            Err(OracleError::Script(_))
        ));
    }
}
