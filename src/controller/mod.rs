//! Renderer-facing facade
//!
//! Registers datasets and views, runs one cut update thread per rendering
//! context and moves each published front into the context's resident
//! buffer on `dispatch`.

mod driver;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use driver::Driver;

use crate::core::camera::ViewCamera;
use crate::core::config::{StreamingConfig, clamp_threshold};
use crate::core::error::Error;
use crate::core::types::{ContextId, DatasetId, Mat4, Result, ViewId};
use crate::cut::{CutDatabase, CutUpdateEngine, CycleReport, EngineConfig, Front};
use crate::dataset::DatasetRegistry;
use crate::gpu::ResidentUploader;
use crate::hierarchy::Hierarchy;
use crate::streaming::{SlotCache, host_slot_count};

pub struct Controller {
    config: StreamingConfig,
    registry: Arc<DatasetRegistry>,
    database: Arc<CutDatabase>,
    host: Option<Arc<SlotCache>>,
    contexts: HashMap<ContextId, Driver>,
    next_context: ContextId,
    num_views: u32,
}

impl Controller {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Streaming controller: render budget {} nodes, upload {} nodes/cycle, {} loader threads",
            config.render_budget_nodes,
            config.upload_budget_nodes,
            config.loader_threads
        );
        Ok(Self {
            config,
            registry: Arc::new(DatasetRegistry::new()),
            database: Arc::new(CutDatabase::new()),
            host: None,
            contexts: HashMap::new(),
            next_context: 0,
            num_views: 0,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DatasetRegistry> {
        &self.registry
    }

    /// Host cache, created with the first dataset
    pub fn host_cache(&self) -> Option<&Arc<SlotCache>> {
        self.host.as_ref()
    }

    /// Register a dataset from its hierarchy and primitive stream files.
    ///
    /// All datasets share the host cache, so their node byte sizes must
    /// agree with the first one.
    pub fn register_dataset(&mut self, hierarchy_path: &Path, stream_path: &Path) -> Result<DatasetId> {
        let hierarchy = Hierarchy::load(hierarchy_path)?;
        let node_bytes = hierarchy.node_byte_size();

        if let Some(host) = &self.host {
            if host.slot_bytes() != node_bytes {
                return Err(Error::Config(format!(
                    "{} has {} byte nodes, host cache holds {} byte nodes",
                    hierarchy_path.display(),
                    node_bytes,
                    host.slot_bytes()
                )));
            }
            return self.registry.register_hierarchy(hierarchy, stream_path);
        }

        let num_slots = host_slot_count(self.config.host_budget_bytes(), node_bytes);
        if num_slots == 0 {
            return Err(Error::Config(format!(
                "host budget of {} MB holds no {} byte node",
                self.config.host_budget_mb, node_bytes
            )));
        }
        let id = self.registry.register_hierarchy(hierarchy, stream_path)?;
        let host = SlotCache::new(num_slots, node_bytes, &self.config, Arc::clone(&self.registry))?;
        self.host = Some(Arc::new(host));
        Ok(id)
    }

    pub fn register_view(&mut self) -> ViewId {
        let id = self.num_views;
        self.num_views += 1;
        id
    }

    /// Create a rendering context with its own resident buffer budget and
    /// start its update thread.
    pub fn create_context(&mut self) -> Result<ContextId> {
        let Some(host) = &self.host else {
            return Err(Error::Config("no dataset registered".into()));
        };
        let id = self.next_context;
        let engine = CutUpdateEngine::new(
            id,
            EngineConfig::from(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(host),
            Arc::clone(&self.database),
        );
        let driver = Driver::spawn(engine)?;
        self.contexts.insert(id, driver);
        self.next_context += 1;
        log::info!("Created context {}", id);
        Ok(id)
    }

    fn driver(&self, context: ContextId) -> Result<&Driver> {
        self.contexts.get(&context).ok_or(Error::UnknownContext(context))
    }

    fn check_view(&self, view: ViewId) -> Result<()> {
        if view < self.num_views { Ok(()) } else { Err(Error::UnknownView(view)) }
    }

    fn check_dataset(&self, dataset: DatasetId) -> Result<()> {
        self.registry.get(dataset).map(|_| ()).ok_or(Error::UnknownDataset(dataset))
    }

    /// Camera of a view for the next update of `context`
    pub fn submit_camera(&self, context: ContextId, view: ViewId, camera: ViewCamera) -> Result<()> {
        self.driver(context)?;
        self.check_view(view)?;
        self.database.set_camera(context, view, camera);
        Ok(())
    }

    pub fn set_transform(&self, context: ContextId, dataset: DatasetId, transform: Mat4) -> Result<()> {
        self.driver(context)?;
        self.check_dataset(dataset)?;
        self.database.set_transform(context, dataset, transform);
        Ok(())
    }

    /// Screen-space error threshold of a dataset, clamped to the valid range
    pub fn set_threshold(&self, context: ContextId, dataset: DatasetId, threshold: f32) -> Result<()> {
        self.driver(context)?;
        self.check_dataset(dataset)?;
        self.database.set_threshold(context, dataset, clamp_threshold(threshold));
        Ok(())
    }

    /// Per-frame entry point.
    ///
    /// If no update is running: exposes the last published front, starts
    /// the next update and uploads the exposed front's new nodes. Returns
    /// true when a new front became visible.
    ///
    /// An upload that failed is retried on the next dispatch, and no update
    /// is started until it succeeds.
    pub fn dispatch(&self, context: ContextId, uploader: &mut impl ResidentUploader) -> Result<bool> {
        let driver = self.driver(context)?;
        if driver.is_busy() {
            return Ok(false);
        }

        let swapped = self.database.swap(context);
        let retrying = !swapped && self.database.is_front_modified(context);
        if !retrying {
            driver.kick();
        }

        if self.database.is_front_modified(context) {
            let front = self.database.front(context).ok_or(Error::UnknownContext(context))?;
            let staging = driver.staging();
            staging.with_buffer(front.staging_buffer(), |bytes| {
                uploader.upload(bytes, staging.slot_bytes(), front.transfers())
            })?;
            self.database.signal_upload_complete(context);
            log::trace!("Context {} uploaded {} nodes", context, front.transfers().len());
        }
        Ok(swapped)
    }

    pub fn is_cut_update_in_progress(&self, context: ContextId) -> Result<bool> {
        Ok(self.driver(context)?.is_busy())
    }

    /// Wait for the running update of `context`. False on timeout.
    pub fn wait_idle(&self, context: ContextId, timeout: Duration) -> Result<bool> {
        Ok(self.driver(context)?.wait_idle(timeout))
    }

    /// Exposed front of a context, for draw submission
    pub fn front(&self, context: ContextId) -> Result<Arc<Front>> {
        self.driver(context)?;
        self.database.front(context).ok_or(Error::UnknownContext(context))
    }

    pub fn last_report(&self, context: ContextId) -> Result<CycleReport> {
        Ok(self.driver(context)?.last_report())
    }

    /// Cycles completed by the update thread of `context`
    pub fn cycles_run(&self, context: ContextId) -> Result<u64> {
        Ok(self.driver(context)?.cycles())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use crate::cut::CycleOutcome;
    use crate::dataset::testing;
    use crate::gpu::HostResidentBuffer;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config() -> StreamingConfig {
        StreamingConfig {
            render_budget_nodes: 10,
            upload_budget_nodes: 4,
            loader_threads: 2,
            host_budget_mb: 1,
            ..Default::default()
        }
    }

    fn camera() -> ViewCamera {
        ViewCamera::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y)
            .with_fov_degrees(60.0)
            .with_viewport_height(1000.0)
    }

    /// Dispatch, wait for the update, then let its loads land
    fn frame(controller: &Controller, context: ContextId, buffer: &mut HostResidentBuffer) -> CycleReport {
        controller.dispatch(context, buffer).unwrap();
        assert!(controller.wait_idle(context, TIMEOUT).unwrap());
        assert!(controller.host_cache().unwrap().flush(TIMEOUT));
        controller.last_report(context).unwrap()
    }

    #[test]
    fn test_end_to_end_split() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = testing::write_fixture(dir.path(), "e2e", 4, 3, 4, 4);
        assert_eq!(fixture.hierarchy.node_count(), 85);

        let mut controller = Controller::new(config()).unwrap();
        let dataset = controller.register_dataset(&fixture.hierarchy_path, &fixture.stream_path).unwrap();
        let view = controller.register_view();
        let context = controller.create_context().unwrap();
        controller.submit_camera(context, view, camera()).unwrap();

        let mut buffer = HostResidentBuffer::new(10, 16);
        let mut saw_root = false;
        for _ in 0..6 {
            frame(&controller, context, &mut buffer);
            let front = controller.front(context).unwrap();
            let nodes = front.cut_nodes(view, dataset);
            assert!(nodes.len() <= 10);
            saw_root |= nodes == vec![0];
            if nodes == vec![1, 2, 3, 4] {
                break;
            }
        }
        assert!(saw_root);

        // The dispatch that exposed the children also uploaded them
        let front = controller.front(context).unwrap();
        assert_eq!(front.cut_nodes(view, dataset), vec![1, 2, 3, 4]);
        for render in front.cut(view, dataset).unwrap() {
            assert_eq!(buffer.slot(render.slot), testing::node_pattern(render.node, 16).as_slice());
        }
    }

    /// Fails every upload whose index is in `failing`
    struct FlakyUploader {
        inner: HostResidentBuffer,
        failing: Vec<usize>,
        calls: usize,
    }

    impl ResidentUploader for FlakyUploader {
        fn upload(&mut self, staging: &[u8], slot_bytes: usize, transfers: &[crate::gpu::TransferDescriptor]) -> Result<()> {
            let call = self.calls;
            self.calls += 1;
            if self.failing.contains(&call) {
                return Err(Error::Upload(format!("upload {} failed", call)));
            }
            self.inner.upload(staging, slot_bytes, transfers)
        }
    }

    #[test]
    fn test_failed_upload_retried_before_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = testing::write_fixture(dir.path(), "flaky", 4, 3, 4, 4);
        let mut controller = Controller::new(config()).unwrap();
        let dataset = controller.register_dataset(&fixture.hierarchy_path, &fixture.stream_path).unwrap();
        let view = controller.register_view();
        let context = controller.create_context().unwrap();
        controller.submit_camera(context, view, camera()).unwrap();

        // The root upload and the children upload both fail once
        let mut uploader = FlakyUploader { inner: HostResidentBuffer::new(10, 16), failing: vec![0, 2], calls: 0 };
        let mut failures = 0;
        let mut retry_pending = false;
        for _ in 0..12 {
            let before = controller.cycles_run(context).unwrap();
            let result = controller.dispatch(context, &mut uploader);
            assert!(controller.wait_idle(context, TIMEOUT).unwrap());
            assert!(controller.host_cache().unwrap().flush(TIMEOUT));
            if retry_pending {
                // Re-uploading the exposed front started no update
                assert_eq!(controller.cycles_run(context).unwrap(), before);
            }

            match result {
                Ok(_) => retry_pending = false,
                Err(Error::Upload(_)) => {
                    failures += 1;
                    retry_pending = true;
                    continue;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
            let front = controller.front(context).unwrap();
            for render in front.cut(view, dataset).into_iter().flatten() {
                assert_eq!(uploader.inner.slot(render.slot), testing::node_pattern(render.node, 16).as_slice());
            }
        }
        assert_eq!(failures, 2);
        let front = controller.front(context).unwrap();
        assert!(front.cut_nodes(view, dataset).len() > 1);
    }

    #[test]
    fn test_first_cycle_waits_for_root() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = testing::write_fixture(dir.path(), "root", 4, 2, 1, 8);
        let mut controller = Controller::new(config()).unwrap();
        controller.register_dataset(&fixture.hierarchy_path, &fixture.stream_path).unwrap();
        let view = controller.register_view();
        let context = controller.create_context().unwrap();
        controller.submit_camera(context, view, camera()).unwrap();

        let mut buffer = HostResidentBuffer::new(10, 8);
        let report = frame(&controller, context, &mut buffer);
        assert_eq!(report.outcome, CycleOutcome::WaitingForRoots);
        assert!(controller.front(context).unwrap().cut_nodes(view, 0).is_empty());
        assert_eq!(controller.cycles_run(context).unwrap(), 1);
    }

    #[test]
    fn test_node_size_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let a = testing::write_fixture(dir.path(), "a", 4, 2, 4, 4);
        let b = testing::write_fixture(dir.path(), "b", 4, 2, 2, 4);
        let mut controller = Controller::new(config()).unwrap();
        controller.register_dataset(&a.hierarchy_path, &a.stream_path).unwrap();
        let err = controller.register_dataset(&b.hierarchy_path, &b.stream_path);
        assert!(matches!(err, Err(Error::Config(_))));
        assert_eq!(controller.registry().len(), 1);
    }

    #[test]
    fn test_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = testing::write_fixture(dir.path(), "ids", 2, 2, 1, 4);
        let mut controller = Controller::new(config()).unwrap();
        assert!(matches!(controller.create_context(), Err(Error::Config(_))));

        controller.register_dataset(&fixture.hierarchy_path, &fixture.stream_path).unwrap();
        let context = controller.create_context().unwrap();
        assert!(matches!(controller.submit_camera(context, 0, camera()), Err(Error::UnknownView(0))));
        assert!(matches!(controller.submit_camera(9, 0, camera()), Err(Error::UnknownContext(9))));
        assert!(matches!(controller.set_threshold(context, 3, 1.0), Err(Error::UnknownDataset(3))));
        let mut buffer = HostResidentBuffer::new(1, 4);
        assert!(matches!(controller.dispatch(9, &mut buffer), Err(Error::UnknownContext(9))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StreamingConfig { upload_budget_nodes: 0, ..config() };
        assert!(matches!(Controller::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_host_budget_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = Hierarchy::regular(
            2,
            1,
            crate::math::Aabb::new(Vec3::ZERO, Vec3::ONE),
            1.0,
            2048,
            1024,
        )
        .unwrap();
        let fixture = testing::write_hierarchy(dir.path(), "big", hierarchy);
        let mut controller = Controller::new(config()).unwrap();
        let err = controller.register_dataset(&fixture.hierarchy_path, &fixture.stream_path);
        assert!(matches!(err, Err(Error::Config(_))));
        assert!(controller.host_cache().is_none());
    }
}
