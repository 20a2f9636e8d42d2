//! Per-context cut update cycle
//!
//! Each cycle:
//! 1. applies finished disk loads to the host cache,
//! 2. bootstraps empty cuts with their root node,
//! 3. classifies every cut node (in parallel over view/dataset pairs),
//! 4. applies splits in order of decreasing error, collapsing nodes to make
//!    room where allowed, then the remaining mandatory collapses,
//! 5. stages new node data and publishes the resulting front.
//!
//! Nodes of a cut and all their ancestors stay acquired on both the host
//! and the GPU cache, so a collapse never has to wait for data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;

use super::action::{ActionQueues, Classification, CutAction};
use super::cut::{Cut, Front, RenderNode};
use super::database::CutDatabase;
use super::gpu_cache::GpuCache;
use super::metric::{ErrorMetric, HYSTERESIS, model_matrix};
use crate::core::camera::ViewCamera;
use crate::core::config::{StreamingConfig, clamp_threshold};
use crate::core::types::{ContextId, DatasetId, Mat4, NodeId, ViewId, ViewerId, viewer_id};
use crate::dataset::{Dataset, DatasetRegistry};
use crate::gpu::{StagingBuffers, TransferDescriptor};
use crate::hierarchy::parent_id;
use crate::streaming::{NodeBudget, RequestState, SlotCache, SlotCounts};

/// Prefetch only below splits whose error exceeds the threshold this many times
const PREFETCH_ERROR_FACTOR: f32 = 4.0;

/// Limits and policy of one engine
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Resident GPU slots of the context
    pub render_budget: usize,
    /// Nodes uploaded per cycle
    pub upload_budget: usize,
    pub default_threshold: f32,
    pub collapse_outside_frustum: bool,
    pub prefetch_budget: usize,
}

impl From<&StreamingConfig> for EngineConfig {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            render_budget: config.render_budget_nodes as usize,
            upload_budget: config.upload_budget_nodes as usize,
            default_threshold: clamp_threshold(config.error_threshold),
            collapse_outside_frustum: config.collapse_outside_frustum,
            prefetch_budget: config.prefetch_budget as usize,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No view has a camera or no dataset is registered
    #[default]
    Idle,
    /// Some root is still loading; nothing was published
    WaitingForRoots,
    /// The last published front was not swapped in yet; nothing changed
    SwapPending,
    Published,
}

/// What one cycle did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub cycle: u64,
    pub splits: usize,
    pub collapses: usize,
    /// Splits refused for lack of budget or data
    pub rejected: usize,
    /// Splits waiting for their children to load
    pub deferred: usize,
    pub loads_requested: usize,
    pub prefetched: usize,
    pub transfers: usize,
}

enum SplitResult {
    Split,
    Deferred,
    Rejected,
}

/// Inputs of the analysis of one (view, dataset) pair
struct Analysis<'a> {
    view: ViewId,
    dataset: &'a Dataset,
    camera: ViewCamera,
    model: Mat4,
    threshold: f32,
    cut: &'a Cut,
}

pub struct CutUpdateEngine {
    context: ContextId,
    config: EngineConfig,
    registry: Arc<DatasetRegistry>,
    host: Arc<SlotCache>,
    database: Arc<CutDatabase>,
    staging: Arc<StagingBuffers>,
    gpu: GpuCache,
    cuts: HashMap<(ViewId, DatasetId), Cut>,
    cycle: u64,
    back_staging: usize,
}

impl CutUpdateEngine {
    pub fn new(
        context: ContextId,
        config: EngineConfig,
        registry: Arc<DatasetRegistry>,
        host: Arc<SlotCache>,
        database: Arc<CutDatabase>,
    ) -> Self {
        database.add_context(context);
        let staging = Arc::new(StagingBuffers::new(config.upload_budget, host.slot_bytes()));
        Self {
            context,
            config,
            registry,
            host,
            database,
            staging,
            gpu: GpuCache::new(config.render_budget),
            cuts: HashMap::new(),
            cycle: 0,
            back_staging: 0,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Staging buffers referenced by published fronts
    pub fn staging(&self) -> &Arc<StagingBuffers> {
        &self.staging
    }

    /// Cut of a pair as of the last cycle
    pub fn cut(&self, view: ViewId, dataset: DatasetId) -> Option<&Cut> {
        self.cuts.get(&(view, dataset))
    }

    pub fn gpu_counts(&self) -> SlotCounts {
        self.gpu.counts()
    }

    fn host_viewer(&self, view: ViewId) -> ViewerId {
        viewer_id(self.context, view)
    }

    /// Run one update cycle and publish its front.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.host.refresh();
        let mut report = CycleReport { cycle: self.cycle + 1, ..Default::default() };

        // The hidden front still owns its transfers and staging buffer
        if self.database.is_swap_required(self.context) {
            report.outcome = CycleOutcome::SwapPending;
            return report;
        }

        let Some(inputs) = self.database.inputs(self.context) else {
            return report;
        };
        let mut views: Vec<ViewId> = inputs.cameras.keys().copied().collect();
        views.sort_unstable();
        let datasets = self.registry.all();
        let mut pairs: Vec<(ViewId, Arc<Dataset>)> = views
            .iter()
            .flat_map(|&view| datasets.iter().map(move |d| (view, Arc::clone(d))))
            .collect();
        if pairs.is_empty() {
            return report;
        }

        // Roots of empty cuts must be on the host before anything else happens
        let mut waiting = false;
        pairs.retain(|(view, dataset)| {
            let id = dataset.id();
            if self.cuts.get(&(*view, id)).is_some_and(|c| !c.is_empty()) {
                return true;
            }
            match self.host.register_node(id, 0, f32::MAX) {
                RequestState::Resident => true,
                RequestState::Unavailable => {
                    log::debug!("Root of dataset {} is unavailable", id);
                    false
                }
                RequestState::Requested => {
                    report.loads_requested += 1;
                    waiting = true;
                    true
                }
                RequestState::Pending | RequestState::Exhausted => {
                    waiting = true;
                    true
                }
            }
        });
        if waiting {
            report.outcome = CycleOutcome::WaitingForRoots;
            return report;
        }

        self.gpu.reset_transfer_budget(self.config.upload_budget);

        let mut fresh = HashSet::new();
        for (view, dataset) in &pairs {
            let key = (*view, dataset.id());
            if self.cuts.get(&key).is_none_or(|c| c.is_empty()) && self.bootstrap_root(*view, dataset.id()) {
                fresh.insert(key);
            }
        }

        let thresholds: HashMap<DatasetId, f32> = datasets
            .iter()
            .map(|d| {
                let t = inputs.threshold(d.id()).unwrap_or(self.config.default_threshold);
                (d.id(), clamp_threshold(t))
            })
            .collect();

        let mut queues = ActionQueues::new();
        {
            let jobs: Vec<Analysis<'_>> = pairs
                .iter()
                .filter(|(view, d)| !fresh.contains(&(*view, d.id())))
                .filter_map(|(view, d)| {
                    let cut = self.cuts.get(&(*view, d.id())).filter(|c| !c.is_empty())?;
                    Some(Analysis {
                        view: *view,
                        dataset: d,
                        camera: inputs.cameras[view],
                        model: model_matrix(&inputs.transform(d.id()), d.hierarchy()),
                        threshold: thresholds[&d.id()],
                        cut,
                    })
                })
                .collect();

            let collapse_outside = self.config.collapse_outside_frustum;
            let actions: Vec<Vec<CutAction>> =
                jobs.par_iter().map(|job| analyse(job, collapse_outside)).collect();
            for batch in actions {
                queues.extend(batch);
            }
        }

        let approved = self.apply(&mut queues, &mut report);

        if self.config.prefetch_budget > 0 {
            self.prefetch(&approved, &thresholds, &mut report);
        }

        let front = self.compile_front(&mut report);
        if !self.database.publish(self.context, front) {
            report.outcome = CycleOutcome::SwapPending;
            return report;
        }
        self.back_staging ^= 1;
        self.cycle += 1;
        report.outcome = CycleOutcome::Published;

        log::debug!(
            "Context {} cycle {}: {} splits, {} collapses, {} rejected, {} deferred, {} loads, {} transfers",
            self.context,
            report.cycle,
            report.splits,
            report.collapses,
            report.rejected,
            report.deferred,
            report.loads_requested,
            report.transfers
        );
        report
    }

    /// Put a host-resident root into the resident buffer and start the cut.
    fn bootstrap_root(&mut self, view: ViewId, dataset: DatasetId) -> bool {
        let viewer = self.host_viewer(view);
        let gpu_resident = self.gpu.is_node_resident(dataset, 0);
        if !gpu_resident && (self.gpu.transfer_budget() == 0 || self.gpu.num_available_slots() == 0) {
            return false;
        }
        if !self.host.try_acquire(viewer, dataset, 0) {
            return false;
        }
        if !gpu_resident && self.gpu.register_node(dataset, 0).is_none() {
            self.host.release(viewer, dataset, 0);
            return false;
        }
        self.gpu.acquire(view, dataset, 0);
        self.cuts.insert((view, dataset), Cut::root());
        true
    }

    /// Execute queued actions. Returns the splits that were carried out.
    fn apply(&mut self, queues: &mut ActionQueues, report: &mut CycleReport) -> Vec<CutAction> {
        let mut approved = Vec::new();

        while let Some(split) = queues.pop_front(Classification::MustSplit) {
            loop {
                if self.gpu.num_available_slots() >= self.gpu_slots_needed(&split) {
                    match self.split_node(&split, report) {
                        SplitResult::Split => {
                            report.splits += 1;
                            approved.push(split);
                        }
                        SplitResult::Deferred => report.deferred += 1,
                        SplitResult::Rejected => report.rejected += 1,
                    }
                    break;
                }

                let victim = queues
                    .pop_front(Classification::MustCollapse)
                    .or_else(|| queues.pop_front(Classification::CollapseOnNeed))
                    .or_else(|| {
                        if queues.back(Classification::MaybeCollapse).is_some_and(|c| c.error < split.error) {
                            queues.pop_back(Classification::MaybeCollapse)
                        } else {
                            None
                        }
                    });
                match victim {
                    Some(collapse) => {
                        self.collapse_node(&collapse);
                        report.collapses += 1;
                    }
                    None => {
                        report.rejected += 1;
                        break;
                    }
                }
            }
        }

        let remaining: Vec<CutAction> = queues.drain(Classification::MustCollapse).collect();
        for collapse in &remaining {
            self.collapse_node(collapse);
            report.collapses += 1;
        }
        // Optional collapses and keeps leave the cut as it is
        approved
    }

    fn dataset(&self, id: DatasetId) -> Option<Arc<Dataset>> {
        self.registry.get(id)
    }

    /// Resident slots a split would newly pin
    fn gpu_slots_needed(&self, split: &CutAction) -> usize {
        let Some(dataset) = self.dataset(split.dataset) else {
            return 0;
        };
        dataset
            .hierarchy()
            .child_range(split.node)
            .filter(|&c| !self.gpu.is_node_acquired(split.dataset, c))
            .count()
    }

    fn split_node(&mut self, split: &CutAction, report: &mut CycleReport) -> SplitResult {
        let Some(dataset) = self.dataset(split.dataset) else {
            return SplitResult::Rejected;
        };
        let id = split.dataset;
        let children = dataset.hierarchy().child_range(split.node);

        let mut all_resident = true;
        let mut unavailable = false;
        for child in children.clone() {
            match self.host.register_node(id, child, split.error) {
                RequestState::Resident => {}
                RequestState::Requested => {
                    report.loads_requested += 1;
                    all_resident = false;
                }
                RequestState::Pending | RequestState::Exhausted => all_resident = false,
                RequestState::Unavailable => unavailable = true,
            }
        }
        if unavailable {
            return SplitResult::Rejected;
        }
        if !all_resident {
            return SplitResult::Deferred;
        }

        let transfers = children.clone().filter(|&c| !self.gpu.is_node_resident(id, c)).count();
        if transfers > self.gpu.transfer_budget() {
            return SplitResult::Rejected;
        }

        let viewer = self.host_viewer(split.view);
        let mut pinned: Vec<NodeId> = Vec::with_capacity(children.len());
        for child in children.clone() {
            if self.host.try_acquire(viewer, id, child) {
                pinned.push(child);
            } else {
                // Evicted by another context since the residency check
                for &p in &pinned {
                    self.host.release(viewer, id, p);
                }
                return SplitResult::Deferred;
            }
        }

        // Pin what is already on the GPU before reserving slots for the rest
        let mut gpu_pinned: Vec<NodeId> = Vec::with_capacity(children.len());
        let mut registered: Vec<NodeId> = Vec::new();
        for child in children.clone() {
            if self.gpu.is_node_resident(id, child) {
                self.gpu.acquire(split.view, id, child);
                gpu_pinned.push(child);
            }
        }
        for child in children.clone() {
            if self.gpu.is_node_resident(id, child) {
                continue;
            }
            if self.gpu.register_node(id, child).is_none() {
                for &p in &gpu_pinned {
                    self.gpu.release(split.view, id, p);
                }
                // Their data was never uploaded
                for &r in &registered {
                    self.gpu.invalidate(id, r);
                }
                for &p in &pinned {
                    self.host.release(viewer, id, p);
                }
                return SplitResult::Rejected;
            }
            registered.push(child);
            self.gpu.acquire(split.view, id, child);
            gpu_pinned.push(child);
        }

        self.cuts.entry((split.view, id)).or_default().split(split.node, children);
        SplitResult::Split
    }

    fn collapse_node(&mut self, collapse: &CutAction) {
        let Some(dataset) = self.dataset(collapse.dataset) else {
            return;
        };
        let id = collapse.dataset;
        let viewer = self.host_viewer(collapse.view);
        let children = dataset.hierarchy().child_range(collapse.node);
        for child in children.clone() {
            self.host.release(viewer, id, child);
            self.gpu.release(collapse.view, id, child);
        }
        self.cuts.entry((collapse.view, id)).or_default().collapse(collapse.node, children);
    }

    /// Request grandchildren of strongly refined splits at low priority.
    fn prefetch(&mut self, approved: &[CutAction], thresholds: &HashMap<DatasetId, f32>, report: &mut CycleReport) {
        if self.host.num_available_slots() * 4 <= self.host.num_slots() {
            return;
        }
        let mut budget = NodeBudget::new(self.config.prefetch_budget);
        for split in approved {
            let threshold = thresholds.get(&split.dataset).copied().unwrap_or(self.config.default_threshold);
            if split.error < threshold * PREFETCH_ERROR_FACTOR {
                continue;
            }
            let Some(dataset) = self.dataset(split.dataset) else {
                continue;
            };
            let hierarchy = dataset.hierarchy();
            for child in hierarchy.child_range(split.node) {
                if hierarchy.is_leaf(child) {
                    continue;
                }
                for grandchild in hierarchy.child_range(child) {
                    if !budget.fits(1) {
                        return;
                    }
                    if self.host.register_node(split.dataset, grandchild, 0.0) == RequestState::Requested {
                        budget.try_take(1);
                        report.prefetched += 1;
                        report.loads_requested += 1;
                    }
                }
            }
        }
    }

    /// Stage this cycle's uploads and build draw lists.
    ///
    /// A node is only drawn once its data is staged in this front or an
    /// earlier one.
    fn compile_front(&mut self, report: &mut CycleReport) -> Front {
        let back = self.back_staging;
        let mut transfers = Vec::new();
        let mut unstaged: HashSet<(DatasetId, NodeId)> = HashSet::new();
        for pending in self.gpu.take_transfers() {
            if !self.gpu.is_node_acquired(pending.dataset, pending.node) {
                self.gpu.invalidate(pending.dataset, pending.node);
                continue;
            }
            if transfers.len() >= self.staging.capacity() {
                unstaged.insert((pending.dataset, pending.node));
                self.gpu.requeue_transfer(pending);
                continue;
            }
            let staging_slot = transfers.len() as u32;
            let staged = self.host.with_node_data(pending.dataset, pending.node, |bytes| {
                self.staging.write(back, staging_slot, bytes)
            });
            match staged {
                Ok(()) => transfers.push(TransferDescriptor { staging_slot, primary_slot: pending.slot }),
                Err(e) => {
                    log::warn!("Deferring upload of node {} of dataset {}: {}", pending.node, pending.dataset, e);
                    unstaged.insert((pending.dataset, pending.node));
                    self.gpu.requeue_transfer(pending);
                }
            }
        }
        report.transfers = transfers.len();

        let mut cuts = HashMap::with_capacity(self.cuts.len());
        for (&(view, dataset), cut) in &self.cuts {
            let list: Vec<RenderNode> = cut
                .iter()
                .filter(|&node| !unstaged.contains(&(dataset, node)))
                .filter_map(|node| self.gpu.slot_of(dataset, node).ok().map(|slot| RenderNode { node, slot }))
                .collect();
            cuts.insert((view, dataset), list);
        }

        Front::new(self.cycle + 1, cuts, transfers, back)
    }
}

/// Classify the nodes of one cut.
///
/// Complete sibling groups are judged together since only a whole group
/// can collapse into its parent.
fn analyse(job: &Analysis<'_>, collapse_outside: bool) -> Vec<CutAction> {
    let hierarchy = job.dataset.hierarchy();
    let fan = hierarchy.fan_factor();
    let metric = ErrorMetric::new(&job.camera, &job.model);
    let nodes = job.cut.to_vec();
    let mut actions = Vec::with_capacity(nodes.len());

    let mut i = 0;
    while i < nodes.len() {
        let node = nodes[i];
        let group_end = i + fan as usize;
        let is_group = node != 0
            && (node - 1) % fan == 0
            && group_end <= nodes.len()
            && nodes[group_end - 1] == node + fan - 1;

        if is_group {
            analyse_group(job, &metric, parent_id(node, fan), &nodes[i..group_end], collapse_outside, &mut actions);
            i = group_end;
        } else {
            actions.push(analyse_node(job, &metric, node));
            i += 1;
        }
    }
    actions
}

fn analyse_group(
    job: &Analysis<'_>,
    metric: &ErrorMetric,
    parent: NodeId,
    group: &[NodeId],
    collapse_outside: bool,
    out: &mut Vec<CutAction>,
) {
    let hierarchy = job.dataset.hierarchy();
    let id = job.dataset.id();
    let parent_error = metric.node_error(hierarchy, parent);

    if group.iter().all(|&n| metric.is_culled(hierarchy, n)) {
        let kind = if collapse_outside { Classification::MustCollapse } else { Classification::CollapseOnNeed };
        out.push(CutAction::new(kind, job.view, id, parent, parent_error));
        return;
    }
    if parent_error < job.threshold - HYSTERESIS {
        out.push(CutAction::new(Classification::MustCollapse, job.view, id, parent, parent_error));
        return;
    }
    if parent_error < job.threshold + HYSTERESIS {
        out.push(CutAction::new(Classification::CollapseOnNeed, job.view, id, parent, parent_error));
        return;
    }

    let singles: Vec<CutAction> = group.iter().map(|&n| analyse_node(job, metric, n)).collect();
    if singles.iter().all(|a| a.kind == Classification::Keep) {
        out.push(CutAction::new(Classification::MaybeCollapse, job.view, id, parent, parent_error));
    } else {
        out.extend(singles);
    }
}

fn analyse_node(job: &Analysis<'_>, metric: &ErrorMetric, node: NodeId) -> CutAction {
    let hierarchy = job.dataset.hierarchy();
    let id = job.dataset.id();
    if metric.is_culled(hierarchy, node) {
        return CutAction::new(Classification::Keep, job.view, id, node, 0.0);
    }
    let error = metric.node_error(hierarchy, node);
    if error > job.threshold + HYSTERESIS && metric.should_split(hierarchy, node, job.threshold) {
        CutAction::new(Classification::MustSplit, job.view, id, node, error)
    } else {
        CutAction::new(Classification::Keep, job.view, id, node, error)
    }
}
