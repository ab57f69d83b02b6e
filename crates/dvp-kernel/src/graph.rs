//! Kernel graph data model.
//!
//! A [`KernelGraph`] is an ordered set of sections plus an order array that
//! ranks them for dispatch.  Each section owns a contiguous, non-overlapping
//! run of nodes inside a client-owned [`NodeArray`].  The boss mutates only
//! the affinity, status and perf fields of nodes; it never frees node storage.
//!
//! ```text
//! NodeArray   [n0 n1 n2 | n3 n4 n5 | n6 n7 n8]
//! sections      sec 0      sec 1      sec 2
//! order         0          0          1
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::image::Image;

// ---------------------------------------------------------------------------
// Cores and kernels
// ---------------------------------------------------------------------------

/// Physical or logical compute domain a node can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    /// Let the router choose the best core supporting the kernel.
    Any,
    /// General-purpose CPU.
    Cpu,
    /// Digital signal processor reached over RPC.
    Dsp,
    /// Programmable GPU.
    Gpu,
    /// Fixed-function accelerator.
    Accel,
}

impl CoreType {
    /// Every concrete core type, excluding [`CoreType::Any`].
    pub const CONCRETE: [CoreType; 4] = [Self::Cpu, Self::Dsp, Self::Gpu, Self::Accel];

    pub fn is_concrete(self) -> bool {
        self != Self::Any
    }
}

impl std::fmt::Display for CoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Cpu => write!(f, "cpu"),
            Self::Dsp => write!(f, "dsp"),
            Self::Gpu => write!(f, "gpu"),
            Self::Accel => write!(f, "accel"),
        }
    }
}

impl std::str::FromStr for CoreType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "cpu" => Ok(Self::Cpu),
            "dsp" => Ok(Self::Dsp),
            "gpu" => Ok(Self::Gpu),
            "accel" => Ok(Self::Accel),
            other => Err(format!("unknown core type `{other}`")),
        }
    }
}

/// Identifier of a kernel.  The built-in set lives in [`crate::kernels`];
/// managers are free to claim additional identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelId(pub u32);

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match crate::kernels::describe(*self) {
            Some(spec) => f.write_str(spec.name),
            None => write!(f, "kernel#{}", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Per-node outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not executed yet (or verified and awaiting execution).
    #[default]
    Pending,
    /// Executed successfully.
    Ok,
    /// No enabled manager supports the kernel on the requested core.
    KernelNotSupported,
    /// Refused by the core's capacity limit.
    Throttled,
    /// The node's images or parameters do not fit the kernel.
    InvalidParameters,
    /// The kernel ran and failed.
    ExecutionFailed,
    /// The remote core could not be reached.
    RemoteFailure,
}

impl NodeStatus {
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Pending | Self::Ok)
    }
}

/// Timing capture for a node, section or graph.
///
/// Start/stop instants are only meaningful once the owning section's
/// completion has been observed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerfRecord {
    started: Option<Instant>,
    stopped: Option<Instant>,
    pub runs: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Duration,
    /// Nominal clock rate of the core that ran the work, in Hz.
    pub clock_rate_hz: u64,
}

impl PerfRecord {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
    }

    /// Stop the clock and fold the elapsed time into the aggregates.
    pub fn stop(&mut self) -> Option<Duration> {
        let started = self.started?;
        let now = Instant::now();
        self.stopped = Some(now);
        let elapsed = now.duration_since(started);
        self.runs += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
        self.max = self.max.max(elapsed);
        Some(elapsed)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    pub fn stopped_at(&self) -> Option<Instant> {
        self.stopped
    }

    /// Duration of the most recent completed run.
    pub fn last(&self) -> Option<Duration> {
        Some(self.stopped?.duration_since(self.started?))
    }

    pub fn average(&self) -> Option<Duration> {
        (self.runs > 0).then(|| self.total / u32::try_from(self.runs).unwrap_or(u32::MAX))
    }
}

/// One scheduled instance of a kernel.
#[derive(Debug, Clone)]
pub struct KernelNode {
    pub kernel: KernelId,
    pub affinity: CoreType,
    pub status: NodeStatus,
    pub perf: PerfRecord,
    /// Inputs first, output last.
    pub images: Vec<Image>,
    /// Scalar kernel parameter (e.g. the threshold level).
    pub value: u32,
}

impl KernelNode {
    pub fn new(kernel: KernelId, affinity: CoreType) -> Self {
        Self {
            kernel,
            affinity,
            status: NodeStatus::Pending,
            perf: PerfRecord::default(),
            images: Vec::new(),
            value: 0,
        }
    }

    pub fn with_images(mut self, images: Vec<Image>) -> Self {
        self.images = images;
        self
    }

    pub fn with_value(mut self, value: u32) -> Self {
        self.value = value;
        self
    }
}

impl Default for KernelNode {
    fn default() -> Self {
        Self::new(crate::kernels::NOOP, CoreType::Any)
    }
}

/// Client-owned node storage.
///
/// The array's mutex is the single lock guarding node memory.  Dispatch
/// copies a section's nodes out, executes on the copy and writes the result
/// back, so the lock is never held while a kernel runs.
#[derive(Debug, Clone, Default)]
pub struct NodeArray {
    inner: Arc<Mutex<Vec<KernelNode>>>,
}

impl NodeArray {
    pub fn new(len: usize) -> Self {
        Self::from_nodes(vec![KernelNode::default(); len])
    }

    pub fn from_nodes(nodes: Vec<KernelNode>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(nodes)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<KernelNode>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of every node, for inspection after completion.
    pub fn snapshot(&self) -> Vec<KernelNode> {
        self.lock().clone()
    }

    /// Whether both handles refer to the same storage.
    pub fn same_as(&self, other: &NodeArray) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// A contiguous run of nodes dispatched as one unit.
#[derive(Debug, Clone)]
pub struct Section {
    nodes: NodeArray,
    first: usize,
    count: usize,
    perf: PerfRecord,
    primed: bool,
}

impl Section {
    pub fn nodes(&self) -> &NodeArray {
        &self.nodes
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.count
    }

    pub fn perf(&self) -> PerfRecord {
        self.perf
    }

    /// Whether the section has run at least once.
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    fn overlaps(&self, other: &Section) -> bool {
        self.first < other.first + other.count && other.first < self.first + self.count
    }
}

// ---------------------------------------------------------------------------
// Graphs
// ---------------------------------------------------------------------------

/// Handle to a graph allocated from the boss's shared region.
///
/// Cheaply cloneable.  All section, order and verification state sits behind
/// one graph-level lock.
#[derive(Clone)]
pub struct KernelGraph {
    inner: Arc<GraphInner>,
}

struct GraphInner {
    id: Uuid,
    section_count: usize,
    state: Mutex<GraphState>,
    /// Serializes processing of this graph and its release.
    exec: Arc<tokio::sync::Mutex<()>>,
}

struct GraphState {
    sections: Vec<Option<Section>>,
    order: Vec<u32>,
    verified: bool,
    perf: PerfRecord,
}

impl KernelGraph {
    pub(crate) fn new(section_count: usize) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                id: Uuid::now_v7(),
                section_count,
                state: Mutex::new(GraphState {
                    sections: vec![None; section_count],
                    order: vec![0; section_count],
                    verified: false,
                    perf: PerfRecord::default(),
                }),
                exec: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn section_count(&self) -> usize {
        self.inner.section_count
    }

    /// Replace the dispatch-order ranks.  Sections sharing a rank may run
    /// concurrently; lower ranks finish before higher ranks start.
    pub fn set_order(&self, order: &[u32]) -> Result<()> {
        if order.len() != self.inner.section_count {
            return Err(KernelError::OrderLength {
                expected: self.inner.section_count,
                found: order.len(),
            });
        }
        self.state().order = order.to_vec();
        Ok(())
    }

    pub fn order(&self) -> Vec<u32> {
        self.state().order.clone()
    }

    pub fn is_verified(&self) -> bool {
        self.state().verified
    }

    pub fn perf(&self) -> PerfRecord {
        self.state().perf
    }

    pub fn section(&self, index: usize) -> Option<Section> {
        self.state().sections.get(index).cloned().flatten()
    }

    // -- Crate-internal -----------------------------------------------------

    fn state(&self) -> MutexGuard<'_, GraphState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn exec_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.inner.exec)
    }

    pub(crate) fn set_verified(&self, verified: bool) {
        self.state().verified = verified;
    }

    pub(crate) fn with_perf<R>(&self, f: impl FnOnce(&mut PerfRecord) -> R) -> R {
        f(&mut self.state().perf)
    }

    pub(crate) fn start_section(&self, index: usize) {
        if let Some(Some(section)) = self.state().sections.get_mut(index) {
            section.perf.start();
        }
    }

    pub(crate) fn finish_section(&self, index: usize) {
        if let Some(Some(section)) = self.state().sections.get_mut(index) {
            section.perf.stop();
            section.primed = true;
        }
    }

    /// Bind `nodes[first..first + count]` to section `index`.
    pub(crate) fn init_section(
        &self,
        index: usize,
        nodes: &NodeArray,
        first: usize,
        count: usize,
    ) -> Result<()> {
        let len = nodes.len();
        if index >= self.inner.section_count {
            return Err(KernelError::SectionOutOfRange {
                section: index,
                count: self.inner.section_count,
            });
        }
        if count == 0 || first.checked_add(count).is_none_or(|end| end > len) {
            return Err(KernelError::InvalidNodeRange { first, count, len });
        }

        let section = Section {
            nodes: nodes.clone(),
            first,
            count,
            perf: PerfRecord::default(),
            primed: false,
        };

        let mut state = self.state();
        for (other, existing) in state.sections.iter().enumerate() {
            let Some(existing) = existing else { continue };
            if other == index {
                continue;
            }
            if !existing.nodes.same_as(nodes) {
                return Err(KernelError::ForeignNodeArray { section: index });
            }
            if existing.overlaps(&section) {
                return Err(KernelError::SectionOverlap {
                    section: index,
                    other,
                });
            }
        }
        state.sections[index] = Some(section);
        state.verified = false;
        Ok(())
    }

    /// Every section, checked to partition its node array exactly.
    pub(crate) fn partition(&self) -> Result<Vec<Section>> {
        let sections = {
            let state = self.state();
            state
                .sections
                .iter()
                .enumerate()
                .map(|(index, s)| {
                    s.clone()
                        .ok_or(KernelError::SectionUninitialized { section: index })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let mut ranges: Vec<_> = sections.iter().map(Section::range).collect();
        ranges.sort_by_key(|r| r.start);
        let mut next = 0;
        for range in &ranges {
            if range.start != next {
                return Err(KernelError::PartitionGap { node: next });
            }
            next = range.end;
        }
        let Some(first) = sections.first() else {
            return Err(KernelError::EmptyGraph);
        };
        let len = first.nodes.len();
        if next != len {
            return Err(KernelError::PartitionGap { node: next });
        }
        Ok(sections)
    }

    /// Section indices grouped by ascending order rank.
    pub(crate) fn ranks(&self) -> BTreeMap<u32, Vec<usize>> {
        let mut ranks: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, rank) in self.state().order.iter().enumerate() {
            ranks.entry(*rank).or_default().push(index);
        }
        ranks
    }
}

impl std::fmt::Debug for KernelGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("KernelGraph")
            .field("id", &self.inner.id)
            .field("sections", &self.inner.section_count)
            .field("order", &state.order)
            .field("verified", &state.verified)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
