//! In-memory host for tests
//!
//! [`FakeHost`] keeps a scriptable device list and permission set, records
//! how often each OS operation ran, and lets a test play the OS: plug and
//! unplug devices, answer permission prompts, inject failures.
//!
//! Permission is tracked per physical location (bus and address), like a
//! device node would be.

use crate::host::{DeviceConnection, HostEvent, HostEventSink, HotplugSubscription, UsbHost};
use crate::lock;
use common::HostError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use usb_types::{DeviceDescriptor, DeviceId, InterfaceDescriptor};

/// How [`FakeHost`] answers [`UsbHost::request_permission`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PermissionBehavior {
    /// Leave the request pending until [`FakeHost::grant`] or
    /// [`FakeHost::deny`]
    #[default]
    Prompt,
    /// Answer immediately with a grant
    AutoGrant,
    /// Answer immediately with a denial
    AutoDeny,
    /// Fail to issue the request at all
    Fail(HostError),
}

/// Scriptable [`UsbHost`]
#[derive(Clone, Default)]
pub struct FakeHost {
    inner: Arc<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    state: Mutex<FakeState>,
    counters: Counters,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct FakeState {
    devices: Vec<DeviceDescriptor>,
    permitted: HashSet<DeviceId>,
    behavior: PermissionBehavior,
    /// Outstanding prompts and where to send their answer
    pending: HashMap<DeviceId, (DeviceDescriptor, HostEventSink)>,
    hotplug: Option<HostEventSink>,
    hotplug_unsupported: bool,
    open_failure: Option<HostError>,
    enumeration_failure: Option<HostError>,
    /// Claimed interface -> owning connection
    claims: HashMap<(DeviceId, u8), u64>,
}

#[derive(Default)]
struct Counters {
    enumerate: AtomicUsize,
    open: AtomicUsize,
    close: AtomicUsize,
    claim: AtomicUsize,
    release: AtomicUsize,
    request: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device without any notification
    ///
    /// Only enumeration (and thus the poll loop) sees it.
    pub fn add_device(&self, device: DeviceDescriptor) {
        let mut state = lock(&self.inner.state);
        state.devices.retain(|d| d.id() != device.id());
        state.devices.push(device);
    }

    /// Remove a device without any notification
    pub fn remove_device(&self, device: &DeviceDescriptor) {
        let mut state = lock(&self.inner.state);
        state.devices.retain(|d| d.id() != device.id());
        state.permitted.remove(&device.id());
        state.claims.retain(|(id, _), _| *id != device.id());
    }

    /// Add a device and broadcast the attach
    pub fn plug(&self, device: DeviceDescriptor) {
        self.add_device(device.clone());
        self.broadcast(HostEvent::Attached(device));
    }

    /// Remove a device and broadcast the detach
    pub fn unplug(&self, device: &DeviceDescriptor) {
        self.remove_device(device);
        self.broadcast(HostEvent::Detached(device.clone()));
    }

    /// Broadcast an arbitrary event on the hot-plug channel
    pub fn broadcast(&self, event: HostEvent) {
        let sink = lock(&self.inner.state).hotplug.clone();
        if let Some(sink) = sink {
            sink.deliver(event);
        }
    }

    /// Change the OS permission silently
    pub fn set_permission(&self, device: &DeviceDescriptor, granted: bool) {
        let mut state = lock(&self.inner.state);
        if granted {
            state.permitted.insert(device.id());
        } else {
            state.permitted.remove(&device.id());
        }
    }

    /// Answer a pending prompt with a grant
    ///
    /// Returns false when no prompt was pending for the device.
    pub fn grant(&self, device: &DeviceDescriptor) -> bool {
        self.answer(device, true)
    }

    /// Answer a pending prompt with a denial
    pub fn deny(&self, device: &DeviceDescriptor) -> bool {
        self.answer(device, false)
    }

    fn answer(&self, device: &DeviceDescriptor, granted: bool) -> bool {
        let pending = {
            let mut state = lock(&self.inner.state);
            if granted {
                state.permitted.insert(device.id());
            }
            state.pending.remove(&device.id())
        };
        match pending {
            Some((device, sink)) => {
                sink.deliver(HostEvent::PermissionResult { device, granted });
                true
            }
            None => false,
        }
    }

    /// Deliver a permission result for `device` on the hot-plug channel
    ///
    /// Models a broadcast nobody asked for, e.g. a grant arriving after the
    /// prompt was forgotten.
    pub fn broadcast_permission(&self, device: &DeviceDescriptor, granted: bool) {
        self.set_permission(device, granted);
        self.broadcast(HostEvent::PermissionResult {
            device: device.clone(),
            granted,
        });
    }

    pub fn set_permission_behavior(&self, behavior: PermissionBehavior) {
        lock(&self.inner.state).behavior = behavior;
    }

    pub fn set_hotplug_supported(&self, supported: bool) {
        lock(&self.inner.state).hotplug_unsupported = !supported;
    }

    /// Make every open fail with `error` (or stop failing with `None`)
    pub fn set_open_failure(&self, error: Option<HostError>) {
        lock(&self.inner.state).open_failure = error;
    }

    pub fn set_enumeration_failure(&self, error: Option<HostError>) {
        lock(&self.inner.state).enumeration_failure = error;
    }

    /// Devices with an unanswered prompt
    pub fn pending_requests(&self) -> Vec<DeviceDescriptor> {
        lock(&self.inner.state)
            .pending
            .values()
            .map(|(device, _)| device.clone())
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.state).hotplug.is_some()
    }

    /// Interfaces of `device` currently claimed by any connection
    pub fn claimed_interfaces(&self, device: &DeviceDescriptor) -> Vec<u8> {
        let mut claimed: Vec<u8> = lock(&self.inner.state)
            .claims
            .keys()
            .filter(|(id, _)| *id == device.id())
            .map(|(_, number)| *number)
            .collect();
        claimed.sort_unstable();
        claimed
    }

    pub fn enumerate_calls(&self) -> usize {
        self.inner.counters.enumerate.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.inner.counters.open.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.inner.counters.close.load(Ordering::SeqCst)
    }

    pub fn claim_calls(&self) -> usize {
        self.inner.counters.claim.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.inner.counters.release.load(Ordering::SeqCst)
    }

    pub fn request_calls(&self) -> usize {
        self.inner.counters.request.load(Ordering::SeqCst)
    }

    /// Successful opens not yet closed
    pub fn open_handles(&self) -> usize {
        self.open_calls() - self.close_calls()
    }
}

impl UsbHost for FakeHost {
    fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, HostError> {
        self.inner.counters.enumerate.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.inner.state);
        match &state.enumeration_failure {
            Some(error) => Err(error.clone()),
            None => Ok(state.devices.clone()),
        }
    }

    fn has_permission(&self, device: &DeviceDescriptor) -> bool {
        lock(&self.inner.state).permitted.contains(&device.id())
    }

    fn request_permission(&self, device: &DeviceDescriptor, results: &HostEventSink) -> Result<(), HostError> {
        self.inner.counters.request.fetch_add(1, Ordering::SeqCst);

        let behavior = {
            let mut state = lock(&self.inner.state);
            let behavior = state.behavior.clone();
            match &behavior {
                PermissionBehavior::Prompt => {
                    state
                        .pending
                        .insert(device.id(), (device.clone(), results.clone()));
                }
                PermissionBehavior::AutoGrant => {
                    state.permitted.insert(device.id());
                }
                PermissionBehavior::AutoDeny | PermissionBehavior::Fail(_) => {}
            }
            behavior
        };

        match behavior {
            PermissionBehavior::Prompt => Ok(()),
            PermissionBehavior::AutoGrant | PermissionBehavior::AutoDeny => {
                results.deliver(HostEvent::PermissionResult {
                    device: device.clone(),
                    granted: behavior == PermissionBehavior::AutoGrant,
                });
                Ok(())
            }
            PermissionBehavior::Fail(error) => Err(error),
        }
    }

    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn DeviceConnection>, HostError> {
        let state = lock(&self.inner.state);
        if let Some(error) = &state.open_failure {
            return Err(error.clone());
        }
        if !state.devices.iter().any(|d| d.id() == device.id()) {
            return Err(HostError::NoDevice);
        }
        if !state.permitted.contains(&device.id()) {
            return Err(HostError::Access);
        }
        drop(state);

        self.inner.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            host: self.inner.clone(),
            device: device.id(),
            id: self.inner.next_connection.fetch_add(1, Ordering::SeqCst),
        }))
    }

    fn watch_hotplug(&self, sink: HostEventSink) -> Result<Option<Box<dyn HotplugSubscription>>, HostError> {
        let mut state = lock(&self.inner.state);
        if state.hotplug_unsupported {
            return Ok(None);
        }
        state.hotplug = Some(sink);
        Ok(Some(Box::new(FakeSubscription {
            host: self.inner.clone(),
        })))
    }
}

struct FakeConnection {
    host: Arc<FakeInner>,
    device: DeviceId,
    id: u64,
}

impl DeviceConnection for FakeConnection {
    fn claim_interface(&mut self, interface: &InterfaceDescriptor, force: bool) -> Result<(), HostError> {
        self.host.counters.claim.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.host.state);
        if !state.devices.iter().any(|d| d.id() == self.device) {
            return Err(HostError::NoDevice);
        }

        let slot = (self.device, interface.number);
        match state.claims.get(&slot) {
            Some(owner) if *owner != self.id && !force => Err(HostError::Busy),
            _ => {
                state.claims.insert(slot, self.id);
                Ok(())
            }
        }
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<(), HostError> {
        self.host.counters.release.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.host.state);
        let slot = (self.device, interface.number);
        if state.claims.get(&slot) == Some(&self.id) {
            state.claims.remove(&slot);
        }
        if !state.devices.iter().any(|d| d.id() == self.device) {
            return Err(HostError::NoDevice);
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), HostError> {
        self.host.counters.close.fetch_add(1, Ordering::SeqCst);
        let id = self.id;
        lock(&self.host.state).claims.retain(|_, owner| *owner != id);
        Ok(())
    }
}

struct FakeSubscription {
    host: Arc<FakeInner>,
}

impl HotplugSubscription for FakeSubscription {
    fn unsubscribe(self: Box<Self>) {
        lock(&self.host.state).hotplug = None;
    }
}
