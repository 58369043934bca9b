//! The hierarchical weighted-selection task engine (C1).
//!
//! A workload is an explicit tagged tree built once at configuration time:
//! composite nodes hold an ordered set of weighted children, leaf nodes hold
//! an operation closure. Execution is single-threaded recursive descent; the
//! only suspension point is the non-blocking control-channel poll performed
//! after every leaf invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;

/// A fully-qualified event path, e.g. `["RandomRW", "read"]`.
pub type EventPath = Arc<Vec<String>>;

/// One completed leaf invocation, emitted when the leaf's `report_stats` is set.
#[derive(Debug, Clone)]
pub struct EventReport {
    /// Path of the tasklet that produced this report.
    pub path: EventPath,
    /// Wall-clock time the operation took.
    pub elapsed: Duration,
    /// Whether the invocation called [`Ctx::fail`].
    pub failed: bool,
}

/// A message sent on a worker's outbound report channel.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// A completed leaf invocation, emitted when the leaf's `report_stats` is set.
    Report(EventReport),
    /// A leaf's operation panicked. Not retried: the runner aborts once this
    /// is sent, unwinding every active ancestor up to the root.
    Err {
        /// Path of the tasklet whose operation panicked.
        path: EventPath,
        /// The panic payload, downcast to a string where possible.
        message: String,
    },
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "leaf operation panicked".to_string()
    }
}

/// A leaf operation. Receives a [`Ctx`] to signal `jump`/`finish`/`fail`.
pub type LeafOp = Arc<dyn Fn(&mut Ctx) + Send + Sync>;

enum NodeKind {
    Composite(Vec<Node>),
    Leaf(LeafOp),
}

/// A node in the declared task tree: either a composite with weighted
/// children, or a leaf with an operation.
pub struct Node {
    name: String,
    weight: f64,
    report_stats: bool,
    kind: NodeKind,
    on_start: Option<LeafOp>,
    on_end: Option<LeafOp>,
}

impl Node {
    /// A composite node. Must have at least one child.
    pub fn composite(name: impl Into<String>, weight: f64, children: Vec<Node>) -> Self {
        assert!(!children.is_empty(), "a composite task must have at least one child");
        Self {
            name: name.into(),
            weight,
            report_stats: false,
            kind: NodeKind::Composite(children),
            on_start: None,
            on_end: None,
        }
    }

    /// A leaf node whose `op` runs synchronously when selected.
    pub fn leaf(name: impl Into<String>, weight: f64, report_stats: bool, op: LeafOp) -> Self {
        Self {
            name: name.into(),
            weight,
            report_stats,
            kind: NodeKind::Leaf(op),
            on_start: None,
            on_end: None,
        }
    }

    /// Attach `on_start`/`on_end` hooks, invoked on every activation of this
    /// node, before and after its operation (the leaf's closure, or a
    /// composite's child-selection loop). `on_start` calling
    /// [`Ctx::fail`] skips the operation and `on_end` entirely, matching a
    /// transaction-style composite that fails fast when it cannot begin.
    pub fn with_hooks(mut self, on_start: Option<LeafOp>, on_end: Option<LeafOp>) -> Self {
        self.on_start = on_start;
        self.on_end = on_end;
        self
    }
}

struct FlatNode {
    #[allow(dead_code)]
    name: String,
    path: EventPath,
    weight: f64,
    report_stats: bool,
    parent: Option<usize>,
    children: Vec<usize>,
    op: Option<LeafOp>,
    on_start: Option<LeafOp>,
    on_end: Option<LeafOp>,
}

/// A task tree flattened for execution.
///
/// Built once from a declared [`Node`] tree; cheap to clone (an `Arc` of
/// flattened nodes) so a single tree definition can back many worker
/// [`Runner`]s.
#[derive(Clone)]
pub struct TaskTree {
    nodes: Arc<Vec<FlatNode>>,
    root: usize,
}

impl TaskTree {
    /// Flatten a declared tree rooted at `root`.
    pub fn build(root: Node) -> Self {
        let mut nodes = Vec::new();
        flatten(root, None, Vec::new(), &mut nodes);
        Self {
            nodes: Arc::new(nodes),
            root: 0,
        }
    }
}

fn flatten(node: Node, parent: Option<usize>, mut path_names: Vec<String>, out: &mut Vec<FlatNode>) -> usize {
    path_names.push(node.name.clone());
    let id = out.len();
    out.push(FlatNode {
        name: node.name,
        path: Arc::new(path_names.clone()),
        weight: node.weight,
        report_stats: node.report_stats,
        parent,
        children: Vec::new(),
        op: None,
        on_start: node.on_start,
        on_end: node.on_end,
    });
    match node.kind {
        NodeKind::Leaf(op) => {
            out[id].op = Some(op);
        }
        NodeKind::Composite(children) => {
            let mut child_ids = Vec::with_capacity(children.len());
            for child in children {
                child_ids.push(flatten(child, Some(id), path_names.clone(), out));
            }
            out[id].children = child_ids;
        }
    }
    id
}

/// Signals the runner to stop after its current leaf completes.
///
/// Cloning and sending on the paired sender is how the benchmark manager
/// (C4) performs a soft stop; the runner observes it at the next leaf
/// boundary, which bounds stop latency to one leaf operation.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = mpsc::channel(1);
    (StopHandle { tx }, StopSignal { rx })
}

/// Sender half of the stop signal; held by the benchmark manager.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    /// Request that the paired runner stop at its next leaf boundary.
    pub async fn request_stop(&self) {
        let _ = self.tx.send(()).await;
    }
}

/// Receiver half of the stop signal; held by the runner.
pub struct StopSignal {
    rx: mpsc::Receiver<()>,
}

struct RunState {
    active: Vec<bool>,
    failed: Vec<bool>,
    next_child: Vec<Option<usize>>,
}

impl RunState {
    fn new(len: usize) -> Self {
        Self {
            active: vec![false; len],
            failed: vec![false; len],
            next_child: vec![None; len],
        }
    }
}

/// Drives one task tree to completion (or until stopped), emitting
/// [`WorkerMessage`]s on `report_tx`.
///
/// A `Runner` executes synchronously; it is intended to be driven from
/// within `tokio::task::spawn_blocking`, one per worker process slot (see
/// `loadforge-node`'s worker pool), matching the task engine's
/// single-threaded-per-worker invariant.
pub struct Runner {
    tree: TaskTree,
    state: RunState,
    rng: rand::rngs::StdRng,
    report_tx: mpsc::Sender<WorkerMessage>,
    stop: StopSignal,
    stopping: bool,
}

impl Runner {
    /// Build a runner for `tree`, reporting to `report_tx`, observing `stop`.
    pub fn new(tree: TaskTree, report_tx: mpsc::Sender<WorkerMessage>, stop: StopSignal) -> Self {
        let len = tree.nodes.len();
        Self {
            tree,
            state: RunState::new(len),
            rng: rand::SeedableRng::from_entropy(),
            report_tx,
            stop,
            stopping: false,
        }
    }

    /// Run the tree to completion. Returns once the root becomes inactive,
    /// either because a leaf called `finish`/`fail` deep enough to unwind the
    /// whole tree, or because a stop signal was observed.
    pub fn run(&mut self) {
        self.execute(self.tree.root);
    }

    fn execute(&mut self, id: usize) {
        self.state.active[id] = true;
        self.state.failed[id] = false;
        let start = Instant::now();

        if let Some(on_start) = self.tree.nodes[id].on_start.clone() {
            let mut ctx = Ctx { interp: self, node_id: id };
            on_start(&mut ctx);
        }

        let mut panicked = false;

        if !self.state.failed[id] {
            let has_op = self.tree.nodes[id].op.is_some();
            if has_op {
                let op = self.tree.nodes[id].op.clone().expect("checked above");
                let mut ctx = Ctx { interp: self, node_id: id };
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| op(&mut ctx))) {
                    Ok(()) => {}
                    Err(payload) => {
                        panicked = true;
                        let path = self.tree.nodes[id].path.clone();
                        let message = panic_message(&*payload);
                        let _ = self.report_tx.blocking_send(WorkerMessage::Err { path, message });
                        self.fail_from(id, i32::MAX);
                    }
                }
            } else {
                while self.state.active[id] {
                    let child = self.choose_child(id);
                    self.execute(child);
                }
            }

            if !panicked && !self.state.failed[id] {
                if let Some(on_end) = self.tree.nodes[id].on_end.clone() {
                    let mut ctx = Ctx { interp: self, node_id: id };
                    on_end(&mut ctx);
                }
            }
        }

        let is_leaf = self.tree.nodes[id].op.is_some();
        if is_leaf && !panicked {
            let elapsed = start.elapsed();
            let report_stats = self.tree.nodes[id].report_stats;
            if report_stats {
                let report = EventReport {
                    path: self.tree.nodes[id].path.clone(),
                    elapsed,
                    failed: self.state.failed[id],
                };
                let _ = self.report_tx.blocking_send(WorkerMessage::Report(report));
            }
            self.poll_stop();
        }
    }

    fn choose_child(&mut self, id: usize) -> usize {
        if let Some(next) = self.state.next_child[id].take() {
            return next;
        }
        let children = &self.tree.nodes[id].children;
        let total_weight: f64 = children.iter().map(|&c| self.tree.nodes[c].weight).sum();
        if total_weight <= 0.0 {
            return children[0];
        }
        let choice: f64 = self.rng.gen_range(0.0..total_weight);
        let mut upto = 0.0;
        for &c in children {
            upto += self.tree.nodes[c].weight;
            if upto >= choice {
                return c;
            }
        }
        *children.last().expect("composite has at least one child")
    }

    fn poll_stop(&mut self) {
        if self.stopping {
            return;
        }
        if self.stop.rx.try_recv().is_ok() {
            self.stopping = true;
            self.state.active[self.tree.root] = false;
        }
    }

    fn finish_from(&mut self, mut id: usize, mut depth: i32) {
        loop {
            self.state.active[id] = false;
            depth -= 1;
            if depth < 0 {
                break;
            }
            match self.tree.nodes[id].parent {
                Some(p) => id = p,
                None => break,
            }
        }
    }

    fn fail_from(&mut self, mut id: usize, mut depth: i32) {
        loop {
            self.state.active[id] = false;
            self.state.failed[id] = true;
            depth -= 1;
            if depth < 0 {
                break;
            }
            match self.tree.nodes[id].parent {
                Some(p) => id = p,
                None => break,
            }
        }
    }

    fn jump(&mut self, from: usize, tokens: &[&str]) {
        if tokens.is_empty() {
            return;
        }
        match tokens[0] {
            "" => {
                if from != self.tree.root {
                    self.state.active[from] = false;
                }
                self.jump(self.tree.root, &tokens[1..]);
            }
            "." => self.jump(from, &tokens[1..]),
            ".." => {
                self.state.active[from] = false;
                let parent = self.tree.nodes[from]
                    .parent
                    .expect("jump('..') past the root");
                self.jump(parent, &tokens[1..]);
            }
            name => self.set_next_task(from, name, &tokens[1..]),
        }
    }

    fn set_next_task(&mut self, id: usize, name: &str, rest: &[&str]) {
        let child_id = self.tree.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| {
                let full = &self.tree.nodes[c].path;
                full.last().map(String::as_str) == Some(name)
            })
            .unwrap_or_else(|| panic!("no child named '{name}' under this task"));
        self.state.next_child[id] = Some(child_id);
        if !rest.is_empty() {
            self.set_next_task(child_id, rest[0], &rest[1..]);
        }
    }
}

/// Handed to a leaf operation; the only way it can affect tree execution.
pub struct Ctx<'a> {
    interp: &'a mut Runner,
    node_id: usize,
}

impl<'a> Ctx<'a> {
    /// End this tasklet (and, by default, its parent). `depth` of 0 ends
    /// only this tasklet; 1 (the default callers should reach for) also ends
    /// the parent; 2 the grandparent, and so on.
    pub fn finish(&mut self, depth: i32) {
        self.interp.finish_from(self.node_id, depth);
    }

    /// Like [`Ctx::finish`], but also marks this invocation as failed so its
    /// report carries `failed = true`. Default depth is 0 (only this
    /// tasklet fails/ends).
    pub fn fail(&mut self, depth: i32) {
        self.interp.fail_from(self.node_id, depth);
    }

    /// Schedule a specific successor by path. Grammar: `/` leads a
    /// root-relative path, `.` is self, `..` is parent; any other segment
    /// names a child. See the crate-level docs for the full semantics.
    pub fn jump(&mut self, path: &str) {
        let tokens: Vec<&str> = path.split('/').collect();
        let parent = self.interp.tree.nodes[self.node_id]
            .parent
            .unwrap_or(self.node_id);
        self.interp.jump(parent, &tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_leaf(name: &str, weight: f64, counter: Arc<AtomicUsize>) -> Node {
        Node::leaf(
            name,
            weight,
            true,
            Arc::new(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn weighted_selection_converges() {
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        let draws = 40_000usize;

        let a = counting_leaf("a", 1.0, a_count.clone());
        let b = counting_leaf("b", 3.0, b_count.clone());
        let tree = TaskTree::build(Node::composite("root", 1.0, vec![a, b]));

        let (tx, rx) = mpsc::channel(8192);
        let (_handle, stop_signal) = stop_channel();
        let mut runner = Runner::new(tree, tx, stop_signal);
        drop(rx);

        for _ in 0..draws {
            let root = runner.tree.root;
            let pick = runner.choose_child(root);
            runner.execute(pick);
        }

        let a_n = a_count.load(Ordering::SeqCst) as f64;
        let b_n = b_count.load(Ordering::SeqCst) as f64;
        let ratio = b_n / a_n;
        // Expected ratio b:a is 3:1; allow generous slack for a finite sample.
        assert!((2.5..3.5).contains(&ratio), "b/a ratio {ratio} out of range");
    }

    #[tokio::test]
    async fn jump_reaches_zero_weight_sibling() {
        let visits = Arc::new(std::sync::Mutex::new(Vec::new()));

        let v1 = visits.clone();
        let p = Node::leaf(
            "p",
            1.0,
            false,
            Arc::new(move |ctx| {
                v1.lock().unwrap().push("p");
                ctx.jump("q");
            }),
        );
        let v2 = visits.clone();
        let iterations = Arc::new(AtomicUsize::new(0));
        let iter_clone = iterations.clone();
        let q = Node::leaf(
            "q",
            0.0,
            false,
            Arc::new(move |ctx| {
                v2.lock().unwrap().push("q");
                let n = iter_clone.fetch_add(1, Ordering::SeqCst);
                if n >= 2 {
                    ctx.finish(i32::MAX);
                } else {
                    ctx.jump("p");
                }
            }),
        );

        let tree = TaskTree::build(Node::composite("root", 1.0, vec![p, q]));
        let (tx, rx) = mpsc::channel(8192);
        let (_handle, stop_signal) = stop_channel();
        let mut runner = Runner::new(tree, tx, stop_signal);
        drop(rx);
        runner.run();

        let seq = visits.lock().unwrap().clone();
        assert_eq!(seq, vec!["p", "q", "p", "q", "p", "q"]);
    }

    #[tokio::test]
    async fn panicking_leaf_reports_err_and_aborts_instead_of_continuing() {
        let ran_after = Arc::new(AtomicUsize::new(0));
        let after = ran_after.clone();

        let boom = Node::leaf("boom", 1.0, true, Arc::new(|_ctx| panic!("kaboom")));
        let safe = counting_leaf("safe", 0.0, after);
        let tree = TaskTree::build(Node::composite("root", 1.0, vec![boom, safe]));

        let (tx, mut rx) = mpsc::channel(8);
        let (_handle, stop_signal) = stop_channel();
        let mut runner = Runner::new(tree, tx, stop_signal);
        runner.run();

        match rx.try_recv() {
            Ok(WorkerMessage::Err { message, .. }) => assert!(message.contains("kaboom")),
            other => panic!("expected a WorkerMessage::Err, got {other:?}"),
        }
        assert_eq!(ran_after.load(Ordering::SeqCst), 0, "sibling leaf must not run after an abort");
    }
}
