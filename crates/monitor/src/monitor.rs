//! Device monitor
//!
//! Per-device lifecycle:
//!
//! ```text
//! Unknown --attach/poll--> Attached --request--> PermissionPending
//! Attached --request, already granted--> Connected
//! PermissionPending --granted--> Connected
//! PermissionPending --denied | request failed--> Denied
//! Connected --consumer close | physical removal--> Detached
//! any --physical removal--> Detached
//! ```
//!
//! A device leaves `Detached` only when it is observed again (hot-plug
//! attach, poll re-announce, or an explicit request).
//!
//! Blocks and states are tracked per physical device ([`DeviceId`]), so two
//! identical units without serial numbers still get separate handles.
//! Permissions are cached per [`DeviceKey`].
//!
//! All transitions run on the worker thread. Host broadcasts and poll ticks
//! are posted there as jobs; consumer calls either read shared tables
//! directly (queries, `open_device`) or post a job (`request_permission`).
//!
//! Hot-plug notifications are not guaranteed to fire, so a poll loop
//! re-enumerates every `poll_interval` and re-announces `on_attach` for all
//! matching devices whenever the matching count grew or the number of granted
//! permissions grew.

use crate::control_block::{CloseNotifier, ControlBlock};
use crate::host::{HostEvent, HostEventSink, HotplugSubscription, UsbHost};
use crate::listener::{DeviceEvent, DeviceListener};
use crate::permission::PermissionRegistry;
use crate::worker::WorkerHandle;
use crate::{lock, read, write};
use common::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use usb_types::{DeviceDescriptor, DeviceFilter, DeviceId, DeviceKey, FilterSet, KeyMode};

/// Lifecycle state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Never seen
    #[default]
    Unknown,
    /// Present, no open handle
    Attached,
    /// A permission request is in flight
    PermissionPending,
    /// Open handle available
    Connected,
    /// Permission refused or the request failed
    Denied,
    /// Removed, or its block was closed; left only when observed again
    Detached,
}

/// Monitor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Delay between poll ticks
    pub poll_interval: Duration,
    /// Delay before the first tick after `register`
    pub initial_poll_delay: Duration,
    /// Key algorithm for the device and permission tables
    pub key_mode: KeyMode,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            initial_poll_delay: Duration::from_millis(100),
            key_mode: KeyMode::Precise,
        }
    }
}

/// USB device monitor
///
/// Construct with [`DeviceMonitor::new`], start with
/// [`register`](DeviceMonitor::register), tear down with
/// [`destroy`](DeviceMonitor::destroy) (also run on drop). The worker the
/// monitor runs on belongs to the caller and outlives the monitor.
pub struct DeviceMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    host: Arc<dyn UsbHost>,
    worker: WorkerHandle,
    settings: MonitorSettings,
    filters: RwLock<FilterSet>,
    permissions: PermissionRegistry,
    blocks: Mutex<HashMap<DeviceId, ControlBlock>>,
    states: Mutex<HashMap<DeviceId, DeviceState>>,
    listener: RwLock<Option<Arc<dyn DeviceListener>>>,
    registration: Mutex<Registration>,
    /// Matching devices seen by the last poll that re-announced
    device_count: AtomicUsize,
    /// Bumped on every register and unregister; stale sinks and poll ticks
    /// compare against it and drop out
    generation: AtomicU64,
    destroyed: AtomicBool,
    self_ref: Weak<Shared>,
}

#[derive(Default)]
struct Registration {
    registered: bool,
    subscription: Option<Box<dyn HotplugSubscription>>,
}

impl DeviceMonitor {
    pub fn new(host: Arc<dyn UsbHost>, worker: WorkerHandle, settings: MonitorSettings) -> Self {
        debug!(
            "Creating device monitor (poll every {:?}, {} keys)",
            settings.poll_interval, settings.key_mode
        );
        let shared = Arc::new_cyclic(|self_ref| Shared {
            host,
            worker,
            permissions: PermissionRegistry::new(settings.key_mode),
            settings,
            filters: RwLock::new(FilterSet::default()),
            blocks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            listener: RwLock::new(None),
            registration: Mutex::new(Registration::default()),
            device_count: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        Self { shared }
    }

    /// Start monitoring and deliver events to `listener`
    ///
    /// Subscribes to hot-plug notifications and schedules the first poll
    /// tick. Calling it while registered only replaces the listener.
    pub fn register<L: DeviceListener>(&self, listener: L) -> Result<()> {
        self.shared.ensure_alive()?;
        *write(&self.shared.listener) = Some(Arc::new(listener));

        let mut registration = lock(&self.shared.registration);
        if registration.registered {
            debug!("Monitor already registered, listener replaced");
            return Ok(());
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        registration.subscription = match self.shared.host.watch_hotplug(self.shared.host_sink(generation)) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Hot-plug notifications unavailable, relying on polling: {}", e);
                None
            }
        };
        registration.registered = true;
        self.shared.device_count.store(0, Ordering::Release);
        drop(registration);

        self.shared
            .schedule_poll(generation, self.shared.settings.initial_poll_delay)?;
        info!("Device monitor registered");
        Ok(())
    }

    /// Stop monitoring
    ///
    /// Hot-plug and permission results that arrive afterwards are ignored and
    /// the poll loop stops at its next tick. Open blocks stay open.
    pub fn unregister(&self) {
        let mut registration = lock(&self.shared.registration);
        self.shared.device_count.store(0, Ordering::Release);
        if !registration.registered {
            return;
        }

        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        registration.registered = false;
        if let Some(subscription) = registration.subscription.take() {
            subscription.unsubscribe();
        }
        info!("Device monitor unregistered");
    }

    pub fn is_registered(&self) -> bool {
        self.shared.is_registered()
    }

    /// Tear the monitor down
    ///
    /// Unregisters, then closes every tracked block on the worker, each
    /// producing `on_disconnect`. Idempotent. Every later call except
    /// queries of this flag fails with [`Error::AlreadyDestroyed`].
    pub fn destroy(&self) {
        self.unregister();
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.shared.clone();
        let teardown = move || shared.close_all_blocks();
        if let Err(e) = self.shared.worker.run_sync(teardown) {
            // Blocks still get closed; there is just nobody to dispatch to
            debug!("Worker unavailable during teardown: {}", e);
            self.shared.close_all_blocks();
        }

        *write(&self.shared.listener) = None;
        self.shared.permissions.clear();
        info!("Device monitor destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Replace the filter list
    pub fn set_filters(&self, filters: Vec<DeviceFilter>) -> Result<()> {
        self.shared.ensure_alive()?;
        *write(&self.shared.filters) = FilterSet::new(filters);
        Ok(())
    }

    pub fn add_filter(&self, filter: DeviceFilter) -> Result<()> {
        self.shared.ensure_alive()?;
        write(&self.shared.filters).push(filter);
        Ok(())
    }

    /// Remove every filter equal to `filter`
    pub fn remove_filter(&self, filter: &DeviceFilter) -> Result<bool> {
        self.shared.ensure_alive()?;
        Ok(write(&self.shared.filters).remove(filter))
    }

    /// Current filter list
    pub fn filters(&self) -> Vec<DeviceFilter> {
        read(&self.shared.filters).iter().cloned().collect()
    }

    /// Attached devices matching `filters`
    ///
    /// An empty slice matches everything.
    pub fn list_devices(&self, filters: &[DeviceFilter]) -> Result<Vec<DeviceDescriptor>> {
        self.shared.ensure_alive()?;
        let set = FilterSet::new(filters.to_vec());
        Ok(set.resolve(self.shared.enumerate()))
    }

    /// Attached devices matching the monitor's own filters
    pub fn device_list(&self) -> Result<Vec<DeviceDescriptor>> {
        self.shared.ensure_alive()?;
        Ok(self.shared.matching_devices())
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.device_list()?.len())
    }

    /// Every attached device, unfiltered
    pub fn all_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.shared.ensure_alive()?;
        Ok(self.shared.enumerate())
    }

    /// Fresh permission query
    pub fn has_permission(&self, device: &DeviceDescriptor) -> Result<bool> {
        self.shared.ensure_alive()?;
        Ok(self.shared.permissions.check(self.shared.host.as_ref(), device))
    }

    /// Ask for access to `device`
    ///
    /// Returns immediately. The outcome arrives as `on_connect` or
    /// `on_cancel`; when permission is already held `on_connect` follows
    /// without any prompt.
    pub fn request_permission(&self, device: &DeviceDescriptor) -> Result<()> {
        self.shared.ensure_alive()?;
        let shared = self.shared.clone();
        let device = device.clone();
        self.shared.worker.post(move || shared.process_request(device))
    }

    /// Open `device` now
    ///
    /// Returns the existing block when one is open. Produces no listener
    /// event.
    pub fn open_device(&self, device: &DeviceDescriptor) -> Result<ControlBlock> {
        self.shared.ensure_alive()?;
        if !self.shared.permissions.check(self.shared.host.as_ref(), device) {
            return Err(Error::AccessDenied);
        }

        let (block, _) = self.shared.obtain_block(device)?;
        self.shared.set_state(device, DeviceState::Connected);
        Ok(block)
    }

    /// Tracked block for `device`, if open
    pub fn control_block(&self, device: &DeviceDescriptor) -> Option<ControlBlock> {
        lock(&self.shared.blocks)
            .get(&device.id())
            .filter(|block| block.is_for(device))
            .cloned()
    }

    /// Last known lifecycle state of `device`
    pub fn state_of(&self, device: &DeviceDescriptor) -> DeviceState {
        self.shared.state(device)
    }

    /// Run one poll check now, outside the regular schedule
    pub fn poll_now(&self) -> Result<()> {
        self.shared.ensure_alive()?;
        let shared = self.shared.clone();
        self.shared.worker.post(move || shared.check_devices())
    }

    /// Block until every job queued so far has run
    pub fn flush(&self) -> Result<()> {
        self.shared.worker.run_sync(|| {})
    }

    /// Log every attached device with its interfaces
    pub fn dump_devices(&self) -> Result<()> {
        self.shared.ensure_alive()?;
        let devices = self.shared.enumerate();
        info!("{} attached devices", devices.len());
        for device in &devices {
            info!(
                "{} class={:02x}/{:02x}/{:02x} usb={} key={}",
                device,
                device.class,
                device.subclass,
                device.protocol,
                device.usb_version_string().unwrap_or_default(),
                self.shared.key(device)
            );
            for interface in &device.interfaces {
                info!(
                    "    interface {} alt {} class={:02x}/{:02x}/{:02x}",
                    interface.number, interface.alt_setting, interface.class, interface.subclass, interface.protocol
                );
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.shared.settings
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Shared {
    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::AlreadyDestroyed)
        } else {
            Ok(())
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn is_registered(&self) -> bool {
        !self.is_destroyed() && lock(&self.registration).registered
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.is_destroyed() && self.generation.load(Ordering::Acquire) == generation
    }

    fn key(&self, device: &DeviceDescriptor) -> DeviceKey {
        DeviceKey::compute(device, self.settings.key_mode)
    }

    fn enumerate(&self) -> Vec<DeviceDescriptor> {
        match self.host.enumerate_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate devices: {}", e);
                Vec::new()
            }
        }
    }

    fn matching_devices(&self) -> Vec<DeviceDescriptor> {
        let devices = self.enumerate();
        read(&self.filters).resolve(devices)
    }

    fn set_state(&self, device: &DeviceDescriptor, state: DeviceState) {
        let previous = lock(&self.states).insert(device.id(), state);
        if previous != Some(state) {
            trace!("{}: {:?} -> {:?}", device.id(), previous.unwrap_or_default(), state);
        }
    }

    fn state(&self, device: &DeviceDescriptor) -> DeviceState {
        lock(&self.states).get(&device.id()).copied().unwrap_or_default()
    }

    /// Unknown or Detached devices become Attached; others keep their state
    fn mark_attached(&self, device: &DeviceDescriptor) {
        let mut states = lock(&self.states);
        let state = states.entry(device.id()).or_default();
        if matches!(state, DeviceState::Unknown | DeviceState::Detached) {
            *state = DeviceState::Attached;
        }
    }

    fn dispatch(&self, event: DeviceEvent) {
        debug_assert!(self.worker.is_worker_thread());
        let listener = read(&self.listener).clone();
        let device = event.device();
        debug!(
            event = event.kind(),
            vid = device.vendor_id,
            pid = device.product_id,
            bus = device.bus_number,
            address = device.device_address,
            "Dispatching"
        );
        if let Some(listener) = listener {
            event.deliver_to(listener.as_ref());
        }
    }

    /// Existing open block for `device`, or a freshly opened one
    ///
    /// The table lock is held across the host open so two callers can never
    /// open the same device twice.
    fn obtain_block(&self, device: &DeviceDescriptor) -> Result<(ControlBlock, bool)> {
        let (block, stale) = {
            let mut blocks = lock(&self.blocks);
            if let Some(block) = blocks.get(&device.id())
                && block.is_for(device)
                && !block.is_closed()
            {
                return Ok((block.clone(), false));
            }

            let link: Weak<dyn CloseNotifier> = self.self_ref.clone();
            let block = ControlBlock::open(self.host.clone(), device.clone(), self.key(device), Some(link))?;
            let stale = blocks.insert(device.id(), block.clone());
            (block, stale)
        };

        // A different device reused the address without a detach being seen
        if let Some(stale) = stale.filter(|b| !b.is_closed()) {
            warn!("Closing stale handle of {} at {}", stale.descriptor(), device.id());
            self.force_close(&stale);
        }
        Ok((block, true))
    }

    /// Close a block the monitor no longer tracks
    ///
    /// When a consumer close is already under way, `close` returns at once
    /// and the consumer's notification may still be queued. Dispatching
    /// here makes that late notification a no-op, keeping `on_disconnect`
    /// ahead of whatever the caller dispatches next.
    fn force_close(&self, block: &ControlBlock) {
        block.close();
        if self.worker.is_worker_thread() && block.mark_disconnected() {
            self.dispatch(DeviceEvent::Disconnect {
                device: block.descriptor().clone(),
                block: block.clone(),
            });
        }
    }

    fn host_sink(&self, generation: u64) -> HostEventSink {
        let shared = self.self_ref.clone();
        HostEventSink::new(move |event| {
            if let Some(shared) = shared.upgrade() {
                shared.enqueue_host_event(generation, event);
            }
        })
    }

    fn enqueue_host_event(self: Arc<Self>, generation: u64, event: HostEvent) {
        if !self.is_current(generation) {
            trace!("Ignoring stale host event {:?}", event);
            return;
        }
        let worker = self.worker.clone();
        if let Err(e) = worker.post(move || self.handle_host_event(generation, event)) {
            warn!("Dropping host event: {}", e);
        }
    }

    fn handle_host_event(&self, generation: u64, event: HostEvent) {
        // Unregistered between posting and running
        if !self.is_current(generation) {
            trace!("Ignoring stale host event {:?}", event);
            return;
        }
        match event {
            HostEvent::Attached(device) => self.process_attach(device),
            HostEvent::Detached(device) => self.process_detach(device),
            HostEvent::PermissionResult { device, granted: true } => self.process_grant(device),
            HostEvent::PermissionResult { device, granted: false } => self.process_cancel(device),
        }
    }

    fn process_attach(&self, device: DeviceDescriptor) {
        if !read(&self.filters).accepts(&device) {
            trace!("Ignoring attach of filtered device {}", device);
            return;
        }
        self.permissions.check(self.host.as_ref(), &device);
        self.mark_attached(&device);
        self.dispatch(DeviceEvent::Attach(device));
    }

    fn process_detach(&self, device: DeviceDescriptor) {
        let id = device.id();
        let tracked = lock(&self.states).contains_key(&id);
        if !tracked && !read(&self.filters).accepts(&device) {
            trace!("Ignoring detach of filtered device {}", device);
            return;
        }

        // Removed first so close() does not look it up again
        let block = {
            let mut blocks = lock(&self.blocks);
            match blocks.get(&id) {
                Some(block) if block.is_for(&device) => blocks.remove(&id),
                _ => None,
            }
        };
        if let Some(block) = block {
            self.force_close(&block);
        }

        self.permissions.revoke(&device);
        self.device_count.store(0, Ordering::Release);
        self.set_state(&device, DeviceState::Detached);
        info!("Device detached: {}", device);
        self.dispatch(DeviceEvent::Detach(device));
    }

    fn process_request(&self, device: DeviceDescriptor) {
        if self.is_destroyed() {
            return;
        }
        if !self.is_registered() {
            debug!("Permission request for {} while unregistered", device);
            self.process_cancel(device);
            return;
        }

        // The consumer holds the descriptor, so the device is observed again
        self.mark_attached(&device);

        if self.host.has_permission(&device) {
            self.process_connect(device);
            return;
        }

        self.set_state(&device, DeviceState::PermissionPending);
        let sink = self.host_sink(self.generation.load(Ordering::Acquire));
        match self.host.request_permission(&device, &sink) {
            Ok(()) => debug!("Permission requested for {}", device),
            Err(e) => {
                warn!("{}", Error::PermissionRequestFailed(e.to_string()));
                self.process_cancel(device);
            }
        }
    }

    /// Grant broadcast from the host
    ///
    /// A repeated grant for a device that already has an open block is not
    /// a new connection.
    fn process_grant(&self, device: DeviceDescriptor) {
        let connected = self.state(&device) == DeviceState::Connected
            && lock(&self.blocks)
                .get(&device.id())
                .is_some_and(|block| block.is_for(&device) && !block.is_closed());
        if connected {
            debug!("Ignoring repeated permission grant for {}", device);
            self.permissions.record(&device, true);
            return;
        }
        self.process_connect(device);
    }

    fn process_connect(&self, device: DeviceDescriptor) {
        if self.is_destroyed() {
            return;
        }
        if self.state(&device) == DeviceState::Detached {
            debug!("Ignoring permission grant for detached device {}", device);
            return;
        }

        self.permissions.record(&device, true);
        let (block, created_new) = match self.obtain_block(&device) {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Failed to open {}: {}", device, e);
                return;
            }
        };

        self.set_state(&device, DeviceState::Connected);
        info!(key = %block.key(), created_new, "Device connected: {}", device);
        self.dispatch(DeviceEvent::Connect {
            device,
            block,
            created_new,
        });
    }

    fn process_cancel(&self, device: DeviceDescriptor) {
        if self.is_destroyed() {
            return;
        }
        self.permissions.record(&device, false);

        match self.state(&device) {
            DeviceState::Detached => {
                debug!("Ignoring permission denial for detached device {}", device);
                return;
            }
            DeviceState::Connected => {}
            _ => self.set_state(&device, DeviceState::Denied),
        }
        info!("Permission denied: {}", device);
        self.dispatch(DeviceEvent::Cancel(device));
    }

    fn schedule_poll(&self, generation: u64, delay: Duration) -> Result<()> {
        let Some(shared) = self.self_ref.upgrade() else {
            return Ok(());
        };
        self.worker.post_delayed(delay, move || shared.poll_tick(generation))
    }

    fn poll_tick(&self, generation: u64) {
        if !self.is_current(generation) {
            trace!("Poll loop generation {} stopped", generation);
            return;
        }

        self.check_devices();

        if let Err(e) = self.schedule_poll(generation, self.settings.poll_interval) {
            warn!("Failed to reschedule poll: {}", e);
        }
    }

    /// One poll check: re-announce everything when devices or grants grew
    fn check_devices(&self) {
        if self.is_destroyed() {
            return;
        }

        let devices = self.matching_devices();
        let count = devices.len();
        let (before, after) = self.permissions.refresh(self.host.as_ref(), &devices);
        let known = self.device_count.load(Ordering::Acquire);
        trace!(
            "Poll: {} matching (known {}), permissions {} -> {}",
            count, known, before, after
        );

        if count > known || after > before {
            self.device_count.store(count, Ordering::Release);
            for device in devices {
                self.mark_attached(&device);
                self.dispatch(DeviceEvent::Attach(device));
            }
        }
    }

    /// Runs on the worker
    fn close_all_blocks(&self) {
        let blocks: Vec<ControlBlock> = lock(&self.blocks).drain().map(|(_, block)| block).collect();
        debug!("Closing {} open blocks", blocks.len());
        for block in blocks {
            self.force_close(&block);
        }
    }

    /// Consumer-side close reached the worker
    fn finish_close(&self, block: &ControlBlock) {
        if !block.mark_disconnected() {
            trace!("Disconnect of {} already dispatched", block.device_id());
            return;
        }

        let device = block.descriptor().clone();
        let tracked = {
            let mut blocks = lock(&self.blocks);
            let tracked = blocks.get(&device.id()).is_some_and(|b| b.same_instance(block));
            if tracked {
                blocks.remove(&device.id());
            }
            tracked
        };

        if tracked {
            self.set_state(&device, DeviceState::Detached);
        }
        self.dispatch(DeviceEvent::Disconnect {
            device,
            block: block.clone(),
        });
    }
}

impl CloseNotifier for Shared {
    fn block_closed(&self, block: &ControlBlock) {
        let Some(shared) = self.self_ref.upgrade() else {
            return;
        };
        let block = block.clone();
        // Inline when already on the worker, so detach and teardown
        // dispatch on_disconnect before carrying on
        if let Err(e) = self.worker.run_sync(move || shared.finish_close(&block)) {
            debug!("Disconnect not delivered: {}", e);
        }
    }
}
