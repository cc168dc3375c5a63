use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::codec::{JsonCodec, RecordCodec};
use crate::config::JoinTreeConfig;
use crate::errors::{ConfigError, JoinError, StreamError};
use crate::join::JoinEngine;
use crate::ledger::DataKey;
use crate::record::Record;
use crate::stream_type::StreamType;
use crate::window::WindowKey;

/// Joins `right` records onto `left` records whose `left_key` equals their `right_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPair<S> {
    pub left: S,
    pub right: S,
    pub left_key: String,
    pub right_key: String,
}

/// A leading stream and the pairs hanging off it, possibly nested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTree<S> {
    pub root: S,
    pub pairs: Vec<JoinPair<S>>,
}

impl<S: StreamType> JoinTree<S> {
    pub fn new(root: S, pairs: Vec<JoinPair<S>>) -> Result<Self, ConfigError> {
        let mut reachable = HashSet::from([root]);
        for pair in &pairs {
            if pair.left_key.is_empty() || pair.right_key.is_empty() {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "join of {} onto {} needs both key fields",
                        pair.right.name(),
                        pair.left.name()
                    ),
                });
            }
            if !reachable.contains(&pair.left) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!(
                        "{} is joined onto before it is part of the tree",
                        pair.left.name()
                    ),
                });
            }
            if !reachable.insert(pair.right) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("{} is joined more than once", pair.right.name()),
                });
            }
        }
        Ok(Self { root, pairs })
    }

    pub fn from_config(config: &JoinTreeConfig) -> Result<Self, ConfigError> {
        let pairs = config
            .pairs
            .iter()
            .map(|pair| {
                Ok(JoinPair {
                    left: stream_named(&pair.left)?,
                    right: stream_named(&pair.right)?,
                    left_key: pair.left_key.clone(),
                    right_key: pair.right_key.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(stream_named(&config.root)?, pairs)
    }
}

pub fn stream_named<S: StreamType>(name: &str) -> Result<S, ConfigError> {
    S::from_name(name).ok_or_else(|| ConfigError::UnknownStream {
        name: name.to_string(),
    })
}

/// Orders a right-side key against the left-side key it should join.
///
/// Missing or mismatched keys classify as `Less`, so such records are skipped.
pub fn compare_join_keys(left: &Value, right: Option<&Value>) -> Ordering {
    let Some(right) = right else {
        return Ordering::Less;
    };
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => r.cmp(&l),
            _ => match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => r.partial_cmp(&l).unwrap_or(Ordering::Less),
                _ => Ordering::Less,
            },
        },
        (Value::String(l), Value::String(r)) => r.cmp(l),
        (Value::Bool(l), Value::Bool(r)) => r.cmp(l),
        _ => Ordering::Less,
    }
}

/// Root records of one group with everything joined onto them.
///
/// Without a window there is exactly one root per group.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedGroup<S> {
    pub roots: Vec<Record>,
    /// Joined records with the stream they came from, in join order.
    pub children: Vec<(S, Record)>,
}

impl<S: StreamType> JoinedGroup<S> {
    pub fn single(root: Record, children: Vec<(S, Record)>) -> Self {
        Self {
            roots: vec![root],
            children,
        }
    }

    pub fn first_root(&self) -> Option<&Record> {
        self.roots.first()
    }

    pub fn children_of(&self, stream: S) -> impl Iterator<Item = &Record> {
        self.children
            .iter()
            .filter(move |(from, _)| *from == stream)
            .map(|(_, record)| record)
    }
}

pub trait Processor<S> {
    fn process(&mut self, group: &JoinedGroup<S>) -> anyhow::Result<Vec<Record>>;
}

impl<S, F> Processor<S> for F
where
    F: FnMut(&JoinedGroup<S>) -> anyhow::Result<Vec<Record>>,
{
    fn process(&mut self, group: &JoinedGroup<S>) -> anyhow::Result<Vec<Record>> {
        self(group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStep {
    /// A group was processed and its positions committed.
    Processed { outputs: usize },
    /// The root record joined the open window, which stays open.
    Buffered,
    /// The root record had no partner and was skipped.
    Dropped,
    /// The root stream had nothing new within the poll window.
    Idle,
    /// A required stream ended; nothing further will be produced.
    Finished,
}

enum Collected {
    Complete,
    Unmatched(&'static str),
    Ended,
}

enum RootRead {
    Record(Record),
    /// The next root belongs to a later window.
    WindowClosed,
    Idle,
    Ended,
}

struct OpenWindow<S> {
    key: Value,
    group: JoinedGroup<S>,
}

/// Runs a [`JoinTree`] one root record at a time.
///
/// After a failed step the next step first rewinds every stream to the last
/// committed data key, so a group is never committed without being emitted.
pub struct JoinDriver<S, B: Backend, P, C = JsonCodec> {
    engine: JoinEngine<S, B, C>,
    tree: JoinTree<S>,
    output: Option<S>,
    processor: P,
    window: Option<Box<dyn WindowKey>>,
    open: Option<OpenWindow<S>>,
    committed: Option<DataKey>,
    rewind_needed: bool,
    finished: bool,
}

impl<S, B, P, C> JoinDriver<S, B, P, C>
where
    S: StreamType,
    B: Backend,
    C: RecordCodec + Clone,
    P: Processor<S>,
{
    pub fn new(engine: JoinEngine<S, B, C>, tree: JoinTree<S>, output: Option<S>, processor: P) -> Self {
        Self {
            engine,
            tree,
            output,
            processor,
            window: None,
            open: None,
            committed: None,
            rewind_needed: false,
            finished: false,
        }
    }

    /// Processes consecutive roots of the same window together.
    pub fn with_window(mut self, window: Box<dyn WindowKey>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn engine(&self) -> &JoinEngine<S, B, C> {
        &self.engine
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Data key of the last group that was processed and committed.
    pub fn last_committed(&self) -> Option<&DataKey> {
        self.committed.as_ref()
    }

    /// Reads one root record, joins it, and processes and commits a group
    /// when one is complete.
    pub fn step(&mut self) -> Result<DriverStep, JoinError> {
        if self.finished {
            return Ok(DriverStep::Finished);
        }

        if self.rewind_needed {
            self.engine.rewind(self.committed.as_ref())?;
            self.rewind_needed = false;
            info!("Rewound streams to the last committed group");
        }

        self.advance().inspect_err(|err| {
            warn!("Join step failed, rewinding before the next step: {}", err);
            self.open = None;
            self.rewind_needed = true;
        })
    }

    /// Steps until the join finishes or `keep_going` returns false.
    pub fn run_while(&mut self, mut keep_going: impl FnMut() -> bool) -> Result<(), JoinError> {
        while keep_going() {
            if self.step()? == DriverStep::Finished {
                break;
            }
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<DriverStep, JoinError> {
        let root = match self.next_root()? {
            RootRead::Record(record) => record,
            RootRead::WindowClosed => return self.flush_window(),
            RootRead::Idle if self.window_expired() => return self.flush_window(),
            RootRead::Idle => return Ok(DriverStep::Idle),
            RootRead::Ended => {
                self.flush_window()?;
                return self.finish();
            }
        };

        let window_key = match (&mut self.window, &self.open) {
            (None, _) => None,
            (Some(_), Some(open)) => Some(open.key.clone()),
            (Some(window), None) => match window.window_of(Some(&root)) {
                Some(key) => Some(key),
                None => {
                    warn!("{} record has no window key: {:?}", self.tree.root.name(), root);
                    self.engine.metrics_mut().groups_dropped += 1;
                    return Ok(DriverStep::Dropped);
                }
            },
        };

        let mut children = Vec::new();
        let ended = match collect_children(
            &mut self.engine,
            &self.tree,
            self.tree.root,
            &root,
            &mut children,
        )? {
            Collected::Complete => false,
            Collected::Unmatched(stream) => {
                warn!("Joined right stream {} ran ahead. Skipping root element", stream);
                self.engine.metrics_mut().groups_dropped += 1;
                return Ok(DriverStep::Dropped);
            }
            Collected::Ended if children.is_empty() => {
                self.flush_window()?;
                return self.finish();
            }
            Collected::Ended => true,
        };

        let Some(key) = window_key else {
            let outputs = self.emit(JoinedGroup::single(root, children))?;
            if ended {
                return self.finish();
            }
            return Ok(DriverStep::Processed { outputs });
        };

        let open = self.open.get_or_insert_with(|| OpenWindow {
            key,
            group: JoinedGroup {
                roots: Vec::new(),
                children: Vec::new(),
            },
        });
        open.group.roots.push(root);
        open.group.children.extend(children);

        if ended {
            self.flush_window()?;
            return self.finish();
        }
        Ok(DriverStep::Buffered)
    }

    fn next_root(&mut self) -> Result<RootRead, StreamError> {
        let root = self.tree.root;
        let item = match (&mut self.window, &self.open) {
            (Some(window), Some(open)) => {
                let comparator = |candidate: &Record| match window.window_of(Some(candidate)) {
                    Some(key) if key == open.key => Ordering::Equal,
                    Some(_) => Ordering::Greater,
                    None => Ordering::Less,
                };
                self.engine.get_joined_elements(root, comparator).next()
            }
            _ => self.engine.get_elements(root).next(),
        };

        match item {
            Some(Ok(record)) => Ok(RootRead::Record(record)),
            Some(Err(StreamError::RanAhead { .. })) => Ok(RootRead::WindowClosed),
            Some(Err(StreamError::Timeout { .. })) => Ok(RootRead::Idle),
            Some(Err(StreamError::EndOfStream { .. })) | None => Ok(RootRead::Ended),
            Some(Err(err)) => Err(err),
        }
    }

    fn window_expired(&mut self) -> bool {
        match (&mut self.window, &self.open) {
            (Some(window), Some(open)) => window
                .window_of(None)
                .is_some_and(|current| current != open.key),
            _ => false,
        }
    }

    fn flush_window(&mut self) -> Result<DriverStep, JoinError> {
        let Some(open) = self.open.take() else {
            return Ok(DriverStep::Idle);
        };
        debug!("Closing window {} with {} roots", open.key, open.group.roots.len());
        let outputs = self.emit(open.group)?;
        Ok(DriverStep::Processed { outputs })
    }

    fn emit(&mut self, group: JoinedGroup<S>) -> Result<usize, JoinError> {
        let data_key = self.engine.get_data_key();
        let outputs = self.processor.process(&group)?;
        let sent = outputs.len();

        match self.output {
            Some(output) => {
                for record in &outputs {
                    self.engine.send(output, record)?;
                }
                self.engine.flush()?;
            }
            None if !outputs.is_empty() => {
                warn!("No output stream configured, dropping {} processed records", sent);
            }
            None => {}
        }

        self.engine.commit(Some(data_key.clone()))?;
        self.committed = Some(data_key);
        let metrics = self.engine.metrics_mut();
        metrics.groups_processed += 1;
        metrics.outputs_sent += sent;
        debug!(
            "Processed group of {} roots with {} joined records",
            group.roots.len(),
            group.children.len()
        );
        Ok(sent)
    }

    fn finish(&mut self) -> Result<DriverStep, JoinError> {
        if let Some(output) = self.output {
            self.engine.send_eos(output)?;
            self.engine.flush()?;
        }
        self.engine.commit(None)?;
        self.finished = true;
        info!("Join finished: {:?}", self.engine.metrics());
        Ok(DriverStep::Finished)
    }
}

fn collect_children<S, B, C>(
    engine: &mut JoinEngine<S, B, C>,
    tree: &JoinTree<S>,
    node: S,
    left: &Record,
    children: &mut Vec<(S, Record)>,
) -> Result<Collected, StreamError>
where
    S: StreamType,
    B: Backend,
    C: RecordCodec + Clone,
{
    let mut ended = false;

    for pair in tree.pairs.iter().filter(|pair| pair.left == node) {
        let Some(left_key) = left.get(&pair.left_key).cloned() else {
            warn!(
                "{} record has no join key {}: {:?}",
                node.name(),
                pair.left_key,
                left
            );
            return Ok(Collected::Unmatched(pair.right.name()));
        };

        let mut matched = Vec::new();
        let stop = loop {
            let comparator = |candidate: &Record| compare_join_keys(&left_key, candidate.get(&pair.right_key));
            let mut stop = None;
            for item in engine.get_joined_elements(pair.right, comparator) {
                match item {
                    Ok(record) => matched.push(record),
                    Err(err) => stop = Some(err),
                }
            }
            match stop {
                // The right side has not produced this key yet; its data
                // timeout turns a silent producer into end of stream.
                Some(StreamError::Timeout { .. }) => continue,
                other => break other,
            }
        };

        match stop {
            Some(StreamError::RanAhead { stream }) if matched.is_empty() => {
                return Ok(Collected::Unmatched(stream));
            }
            Some(StreamError::RanAhead { .. }) | None => {}
            Some(StreamError::EndOfStream { .. }) => ended = true,
            Some(err) => return Err(err),
        }

        for record in matched {
            children.push((pair.right, record.clone()));
            match collect_children(engine, tree, pair.right, &record, children)? {
                Collected::Complete => {}
                Collected::Ended => ended = true,
                unmatched @ Collected::Unmatched(_) => return Ok(unmatched),
            }
        }
    }

    Ok(if ended {
        Collected::Ended
    } else {
        Collected::Complete
    })
}
