//! Integration tests for DeviceMonitor
//!
//! Drives the monitor through a FakeHost:
//! - Poll loop re-announcement
//! - Permission grant, denial and request failure
//! - ControlBlock lifecycle and disconnect ordering
//! - Unregister and teardown

use common::{Error, setup_test_logging};
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_mock_camera, create_mock_device, create_mock_hid_device, create_mock_hub_device, with_timeout,
};
use monitor::testing::{FakeHost, PermissionBehavior};
use monitor::{
    ControlBlock, DeviceEvent, DeviceListener, DeviceMonitor, DeviceState, MonitorSettings, Worker, event_channel,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use usb_types::{DeviceDescriptor, DeviceFilter, KeyMode};

/// Ticks only run through `poll_now`
fn manual_settings() -> MonitorSettings {
    MonitorSettings {
        poll_interval: Duration::from_secs(3600),
        initial_poll_delay: Duration::from_secs(3600),
        key_mode: KeyMode::Precise,
    }
}

// Field order matters: the monitor is torn down before its worker
struct Harness {
    host: FakeHost,
    monitor: DeviceMonitor,
    events: async_channel::Receiver<DeviceEvent>,
    _worker: Worker,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(manual_settings())
    }

    fn with_settings(settings: MonitorSettings) -> Self {
        setup_test_logging();
        let host = FakeHost::new();
        let worker = Worker::spawn("monitor-test").unwrap();
        let monitor = DeviceMonitor::new(Arc::new(host.clone()), worker.handle(), settings);
        let (listener, events) = event_channel();
        monitor.register(listener).unwrap();
        Self {
            host,
            monitor,
            events,
            _worker: worker,
        }
    }

    /// Every event dispatched so far
    ///
    /// Flushes twice: a job may queue a follow-up job (an immediate
    /// permission answer) behind the first barrier.
    fn events(&self) -> Vec<DeviceEvent> {
        self.monitor.flush().unwrap();
        self.monitor.flush().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }

    fn poll(&self) -> Vec<DeviceEvent> {
        self.monitor.poll_now().unwrap();
        self.events()
    }

    /// Attach `device` through a hot-plug broadcast and drain the event
    fn plug(&self, device: &DeviceDescriptor) {
        self.host.plug(device.clone());
        assert_eq!(self.kinds(), vec!["attach"]);
    }

    /// Plug, request and grant, returning the connected block
    fn connect(&self, device: &DeviceDescriptor) -> ControlBlock {
        self.plug(device);
        self.monitor.request_permission(device).unwrap();
        self.monitor.flush().unwrap();
        assert!(self.host.grant(device));

        let events = self.events();
        assert_eq!(events.len(), 1);
        match events.into_iter().next() {
            Some(DeviceEvent::Connect {
                block, created_new, ..
            }) => {
                assert!(created_new);
                block
            }
            other => panic!("expected connect, got {:?}", other),
        }
    }
}

fn camera_vendor_filter() -> DeviceFilter {
    DeviceFilter::from_ids(0x8801, -1, -1, -1, -1)
}

mod poll_loop {
    use super::*;

    #[test]
    fn test_new_devices_announced_once() {
        let h = Harness::new();
        h.monitor.set_filters(vec![camera_vendor_filter()]).unwrap();

        assert!(h.poll().is_empty());

        h.host.add_device(create_mock_device(1, 0x8801, 0x0001));
        h.host.add_device(create_mock_device(2, 0x8801, 0x0002));
        h.host.add_device(create_mock_device(3, 0x1234, 0x0003));

        let events = h.poll();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, DeviceEvent::Attach(_))));
        assert!(events.iter().all(|e| e.device().vendor_id == 0x8801));

        assert!(h.poll().is_empty());
    }

    #[test]
    fn test_growth_reannounces_every_device() {
        let h = Harness::new();
        h.host.add_device(create_mock_device(1, 0x1111, 0x0001));
        assert_eq!(h.poll().len(), 1);

        h.host.add_device(create_mock_device(2, 0x2222, 0x0002));
        assert_eq!(h.poll().len(), 2);
    }

    #[test]
    fn test_new_permission_reannounces() {
        let h = Harness::new();
        let device = create_mock_device(1, 0x1111, 0x0001);
        h.host.add_device(device.clone());
        assert_eq!(h.poll().len(), 1);

        h.host.set_permission(&device, true);
        assert_eq!(h.poll().len(), 1);
        assert!(h.poll().is_empty());
    }

    #[test]
    fn test_shrinking_is_silent() {
        let h = Harness::new();
        let first = create_mock_device(1, 0x1111, 0x0001);
        h.host.add_device(first.clone());
        h.host.add_device(create_mock_device(2, 0x2222, 0x0002));
        assert_eq!(h.poll().len(), 2);

        h.host.remove_device(&first);
        assert!(h.poll().is_empty());
    }

    #[test]
    fn test_attached_state_after_poll() {
        let h = Harness::new();
        let device = create_mock_device(1, 0x1111, 0x0001);
        assert_eq!(h.monitor.state_of(&device), DeviceState::Unknown);

        h.host.add_device(device.clone());
        h.poll();
        assert_eq!(h.monitor.state_of(&device), DeviceState::Attached);
    }

    #[test]
    fn test_scheduled_ticks_run() {
        let h = Harness::with_settings(MonitorSettings {
            poll_interval: Duration::from_millis(20),
            initial_poll_delay: Duration::from_millis(10),
            key_mode: KeyMode::Precise,
        });
        h.host.add_device(create_mock_device(1, 0x1111, 0x0001));

        let event = h.events.recv_blocking().unwrap();
        assert!(matches!(event, DeviceEvent::Attach(_)));

        // Ticks keep enumerating without re-announcing
        let calls = h.host.enumerate_calls();
        std::thread::sleep(Duration::from_millis(100));
        assert!(h.host.enumerate_calls() > calls);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_event_stream_follows_hotplug() {
        let h = Harness::with_settings(MonitorSettings {
            poll_interval: Duration::from_millis(20),
            initial_poll_delay: Duration::from_millis(10),
            key_mode: KeyMode::Precise,
        });
        let camera = create_mock_camera(1);
        h.host.plug(camera.clone());

        let event = with_timeout(DEFAULT_TEST_TIMEOUT, h.events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, DeviceEvent::Attach(ref d) if *d == camera));

        h.host.unplug(&camera);
        loop {
            let event = with_timeout(DEFAULT_TEST_TIMEOUT, h.events.recv()).await.unwrap().unwrap();
            if let DeviceEvent::Detach(device) = event {
                assert_eq!(device, camera);
                break;
            }
        }
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Detached);
    }

    #[test]
    fn test_enumeration_failure_yields_empty_list() {
        let h = Harness::new();
        h.host.add_device(create_mock_device(1, 0x1111, 0x0001));
        h.host.set_enumeration_failure(Some(common::HostError::Other("busy bus".into())));

        assert!(h.monitor.device_list().unwrap().is_empty());
        assert!(h.poll().is_empty());
    }
}

mod hotplug {
    use super::*;

    #[test]
    fn test_filtered_attach_is_ignored() {
        let h = Harness::new();
        h.monitor.set_filters(vec![camera_vendor_filter()]).unwrap();

        h.host.plug(create_mock_device(1, 0x1234, 0x0001));
        assert!(h.events().is_empty());

        h.host.plug(create_mock_camera(2));
        assert_eq!(h.kinds(), vec!["attach"]);
    }

    #[test]
    fn test_detach_of_untracked_filtered_device_is_ignored() {
        let h = Harness::new();
        h.monitor.set_filters(vec![camera_vendor_filter()]).unwrap();

        h.host.unplug(&create_mock_device(1, 0x1234, 0x0001));
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_detach_marks_state_and_revokes() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);
        h.host.set_permission(&camera, true);

        h.host.unplug(&camera);
        assert_eq!(h.kinds(), vec!["detach"]);
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Detached);
        assert!(!h.monitor.has_permission(&camera).unwrap());
    }

    #[test]
    fn test_without_hotplug_support_polling_still_works() {
        let host = FakeHost::new();
        host.set_hotplug_supported(false);
        let worker = Worker::spawn("monitor-test-nohotplug").unwrap();
        let monitor = DeviceMonitor::new(Arc::new(host.clone()), worker.handle(), manual_settings());
        let (listener, events) = event_channel();

        monitor.register(listener).unwrap();
        assert!(monitor.is_registered());
        assert!(!host.is_subscribed());

        host.add_device(create_mock_camera(1));
        monitor.poll_now().unwrap();
        monitor.flush().unwrap();
        assert!(matches!(events.try_recv(), Ok(DeviceEvent::Attach(_))));

        monitor.destroy();
        worker.shutdown();
    }
}

mod permissions {
    use super::*;

    #[test]
    fn test_prompt_then_denied() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);

        h.monitor.request_permission(&camera).unwrap();
        assert!(h.events().is_empty());
        assert_eq!(h.monitor.state_of(&camera), DeviceState::PermissionPending);
        assert_eq!(h.host.pending_requests(), vec![camera.clone()]);

        assert!(h.host.deny(&camera));
        assert_eq!(h.kinds(), vec!["cancel"]);
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Denied);
        assert!(h.monitor.control_block(&camera).is_none());
        assert_eq!(h.host.open_calls(), 0);
    }

    #[test]
    fn test_prompt_then_granted() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);

        assert_eq!(h.monitor.state_of(&camera), DeviceState::Connected);
        assert!(block.is_tracked());
        assert_eq!(h.monitor.control_block(&camera), Some(block));
        assert_eq!(h.host.open_calls(), 1);
    }

    #[test]
    fn test_request_when_already_granted_reuses_block() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);

        h.monitor.request_permission(&camera).unwrap();
        let events = h.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::Connect {
                block: again,
                created_new,
                ..
            } => {
                assert!(!created_new);
                assert_eq!(again, &block);
            }
            other => panic!("expected connect, got {:?}", other),
        }
        assert_eq!(h.host.open_calls(), 1);
        assert_eq!(h.host.request_calls(), 1);
    }

    #[test]
    fn test_repeated_grant_broadcast_connects_once() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.connect(&camera);

        h.host.broadcast_permission(&camera, true);
        h.host.broadcast_permission(&camera, true);
        assert!(h.events().is_empty());

        h.host.unplug(&camera);
        assert_eq!(h.kinds(), vec!["disconnect", "detach"]);
    }

    #[test]
    fn test_request_failure_cancels() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);
        h.host
            .set_permission_behavior(PermissionBehavior::Fail(common::HostError::NotSupported));

        h.monitor.request_permission(&camera).unwrap();
        assert_eq!(h.kinds(), vec!["cancel"]);
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Denied);
    }

    #[test]
    fn test_auto_grant_answered_inline() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);
        h.host.set_permission_behavior(PermissionBehavior::AutoGrant);

        h.monitor.request_permission(&camera).unwrap();
        assert_eq!(h.kinds(), vec!["connect"]);
    }

    #[test]
    fn test_request_while_unregistered_cancels() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.host.add_device(camera.clone());
        h.host.set_permission(&camera, true);
        h.monitor.unregister();

        h.monitor.request_permission(&camera).unwrap();
        assert_eq!(h.kinds(), vec!["cancel"]);
        assert_eq!(h.host.open_calls(), 0);
    }

    #[test]
    fn test_grant_after_detach_is_ignored() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);
        h.monitor.request_permission(&camera).unwrap();
        h.monitor.flush().unwrap();

        h.host.unplug(&camera);
        assert_eq!(h.kinds(), vec!["detach"]);

        h.host.grant(&camera);
        assert!(h.events().is_empty());
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Detached);
        assert_eq!(h.host.open_calls(), 0);
    }

    #[test]
    fn test_open_failure_on_grant_is_silent() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);
        h.host.set_open_failure(Some(common::HostError::Busy));
        h.host.set_permission_behavior(PermissionBehavior::AutoGrant);

        h.monitor.request_permission(&camera).unwrap();
        assert!(h.events().is_empty());
        assert_ne!(h.monitor.state_of(&camera), DeviceState::Connected);
    }

    #[test]
    fn test_has_permission_is_fresh() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.host.add_device(camera.clone());

        assert!(!h.monitor.has_permission(&camera).unwrap());
        h.host.set_permission(&camera, true);
        assert!(h.monitor.has_permission(&camera).unwrap());
    }
}

mod control_blocks {
    use super::*;

    #[test]
    fn test_open_device_twice_opens_once() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.host.add_device(camera.clone());
        h.host.set_permission(&camera, true);

        let first = h.monitor.open_device(&camera).unwrap();
        let second = h.monitor.open_device(&camera).unwrap();

        assert_eq!(first, second);
        assert_eq!(h.host.open_calls(), 1);
        assert!(h.events().is_empty());
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Connected);
    }

    #[test]
    fn test_open_device_without_permission() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.host.add_device(camera.clone());

        assert!(matches!(h.monitor.open_device(&camera), Err(Error::AccessDenied)));
        assert_eq!(h.host.open_calls(), 0);
    }

    #[test]
    fn test_close_twice_disconnects_once() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);
        block.claim_interface(1, 0, false).unwrap();

        block.close();
        block.close();

        assert_eq!(h.kinds(), vec!["disconnect"]);
        assert!(h.monitor.control_block(&camera).is_none());
        assert_eq!(h.monitor.state_of(&camera), DeviceState::Detached);
        assert_eq!(h.host.open_handles(), 0);
        assert!(h.host.claimed_interfaces(&camera).is_empty());
    }

    #[test]
    fn test_disconnect_dispatched_before_close_returns() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);

        block.close();

        // No flush: close() itself waited for the dispatch
        assert!(matches!(h.events.try_recv(), Ok(DeviceEvent::Disconnect { .. })));
    }

    #[test]
    fn test_reopen_after_close_creates_new_block() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);
        block.close();
        h.events();

        let reopened = h.monitor.open_device(&camera).unwrap();
        assert!(!reopened.is_closed());
        assert!(block.is_closed());
        assert_eq!(h.host.open_calls(), 2);
    }

    #[test]
    fn test_detach_closes_block_before_detach_event() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);
        block.claim_interface(0, 0, false).unwrap();

        h.host.unplug(&camera);
        let events = h.events();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["disconnect", "detach"]);

        assert!(block.is_closed());
        assert!(matches!(block.claim_interface(0, 0, false), Err(Error::AlreadyClosed)));
        assert_eq!(h.host.open_handles(), 0);

        // The consumer closing its copy afterwards changes nothing
        block.close();
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_duplicate_is_untracked() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);

        let copy = block.duplicate().unwrap();
        copy.close();
        assert!(h.events().is_empty());
        assert!(!block.is_closed());
        assert_eq!(h.host.open_handles(), 1);
    }

    #[test]
    fn test_coarse_keys_still_open_each_unit() {
        let h = Harness::with_settings(MonitorSettings {
            key_mode: KeyMode::Coarse,
            ..manual_settings()
        });
        let a = create_mock_camera(1);
        let b = create_mock_camera(2);
        for device in [&a, &b] {
            h.host.add_device(device.clone());
            h.host.set_permission(device, true);
        }

        let first = h.monitor.open_device(&a).unwrap();
        let second = h.monitor.open_device(&b).unwrap();
        assert_eq!(first.key(), second.key());
        assert_ne!(first, second);
        assert_eq!(h.host.open_calls(), 2);
    }

    /// Cheap identical units: no serial, no strings, same key
    fn bare_camera(address: u8) -> DeviceDescriptor {
        DeviceDescriptor::new(0x8801, 0x1234)
            .with_class(0xef, 0x02, 0x01)
            .at(1, address)
    }

    #[test]
    fn test_identical_units_get_separate_blocks() {
        let h = Harness::new();
        let a = bare_camera(1);
        let b = bare_camera(2);
        for device in [&a, &b] {
            h.host.add_device(device.clone());
            h.host.set_permission(device, true);
        }

        let block_a = h.monitor.open_device(&a).unwrap();
        let block_b = h.monitor.open_device(&b).unwrap();
        assert_eq!(block_a.key(), block_b.key());
        assert_eq!(h.host.open_calls(), 2);
        assert_eq!(block_b.device_address(), 2);
        assert_eq!(h.monitor.control_block(&b).unwrap(), block_b);

        h.host.unplug(&b);
        let events = h.events();
        let seen: Vec<_> = events.iter().map(|e| (e.kind(), e.device().device_address)).collect();
        assert_eq!(seen, vec![("disconnect", 2), ("detach", 2)]);

        assert!(!block_a.is_closed());
        assert!(block_b.is_closed());
        assert_eq!(h.monitor.state_of(&a), DeviceState::Connected);
        assert_eq!(h.monitor.state_of(&b), DeviceState::Detached);
        assert_eq!(h.host.open_handles(), 1);
    }

    #[test]
    fn test_detach_closes_block_after_strings_become_readable() {
        let h = Harness::new();
        let unreadable = bare_camera(1);
        h.host.add_device(unreadable.clone());
        h.host.set_permission(&unreadable, true);
        let block = h.monitor.open_device(&unreadable).unwrap();

        // Strings become readable once the device can be opened
        let readable = bare_camera(1).with_serial("SN1").with_strings("Acme", "Cam");
        h.host.unplug(&readable);

        assert_eq!(h.kinds(), vec!["disconnect", "detach"]);
        assert!(block.is_closed());
        assert_eq!(h.host.open_handles(), 0);
    }

    #[test]
    fn test_precise_keys_separate_units() {
        let h = Harness::new();
        let a = create_mock_camera(1);
        let b = create_mock_camera(2);
        for device in [&a, &b] {
            h.host.add_device(device.clone());
            h.host.set_permission(device, true);
        }

        let first = h.monitor.open_device(&a).unwrap();
        let second = h.monitor.open_device(&b).unwrap();
        assert_ne!(first, second);
        assert_eq!(h.host.open_calls(), 2);
    }
}

mod races {
    use super::*;
    use std::thread;

    const ROUNDS: usize = 100;

    #[test]
    fn test_consumer_close_racing_detach() {
        for round in 0..ROUNDS {
            let h = Harness::new();
            let camera = create_mock_camera(1);
            let block = h.connect(&camera);
            block.claim_interface(1, 0, false).unwrap();

            let consumer = block.clone();
            let closer = thread::spawn(move || consumer.close());
            h.host.unplug(&camera);
            closer.join().unwrap();

            assert_eq!(h.kinds(), vec!["disconnect", "detach"], "round {}", round);
            assert_eq!(h.host.close_calls(), 1, "round {}", round);
            assert_eq!(h.host.open_handles(), 0);
            assert!(block.is_closed());
            assert_eq!(h.monitor.state_of(&camera), DeviceState::Detached);
        }
    }

    #[test]
    fn test_consumer_close_racing_destroy() {
        for round in 0..ROUNDS {
            let h = Harness::new();
            let camera = create_mock_camera(1);
            let block = h.connect(&camera);

            let consumer = block.clone();
            let closer = thread::spawn(move || consumer.close());
            h.monitor.destroy();
            closer.join().unwrap();

            assert_eq!(h.kinds(), vec!["disconnect"], "round {}", round);
            assert_eq!(h.host.close_calls(), 1, "round {}", round);
            assert_eq!(h.host.open_handles(), 0);
        }
    }

    #[test]
    fn test_concurrent_consumer_closes() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let consumer = block.clone();
                thread::spawn(move || consumer.close())
            })
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }

        assert_eq!(h.kinds(), vec!["disconnect"]);
        assert_eq!(h.host.close_calls(), 1);
    }
}

mod filters {
    use super::*;

    #[test]
    fn test_list_devices_exclusion_wins() {
        let h = Harness::new();
        h.host.add_device(create_mock_device(1, 0x8801, 0x1234));
        h.host.add_device(create_mock_device(2, 0x8802, 0x1234));

        let include = camera_vendor_filter();
        assert_eq!(h.monitor.list_devices(&[include.clone()]).unwrap().len(), 1);

        let exclude = camera_vendor_filter().excluding();
        assert!(h.monitor.list_devices(&[include, exclude]).unwrap().is_empty());
        assert_eq!(h.monitor.list_devices(&[]).unwrap().len(), 2);
    }

    #[test]
    fn test_filter_management() {
        let h = Harness::new();
        h.host.add_device(create_mock_device(1, 0x8801, 0x1234));
        h.host.add_device(create_mock_device(2, 0x8802, 0x1234));

        h.monitor.add_filter(camera_vendor_filter()).unwrap();
        assert_eq!(h.monitor.device_count().unwrap(), 1);
        assert_eq!(h.monitor.all_devices().unwrap().len(), 2);

        assert!(h.monitor.remove_filter(&camera_vendor_filter()).unwrap());
        assert!(h.monitor.filters().is_empty());
        assert_eq!(h.monitor.device_count().unwrap(), 2);
    }

    #[test]
    fn test_class_filter_skips_hubs() {
        let h = Harness::new();
        h.host.add_device(create_mock_hid_device(1));
        h.host.add_device(create_mock_hub_device(2));
        h.monitor
            .set_filters(vec![DeviceFilter::any(), DeviceFilter::any().class(0x09).excluding()])
            .unwrap();

        let events = h.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device().vendor_id, 0x046d);
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_unregister_stops_events() {
        let h = Harness::new();
        assert!(h.host.is_subscribed());

        h.monitor.unregister();
        assert!(!h.monitor.is_registered());
        assert!(!h.host.is_subscribed());

        h.host.plug(create_mock_camera(1));
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_reregister_restarts_announcements() {
        let h = Harness::new();
        h.host.add_device(create_mock_device(1, 0x1111, 0x0001));
        assert_eq!(h.poll().len(), 1);

        h.monitor.unregister();
        let (listener, events) = event_channel();
        h.monitor.register(listener).unwrap();
        assert!(h.host.is_subscribed());

        h.monitor.poll_now().unwrap();
        h.monitor.flush().unwrap();
        assert!(matches!(events.try_recv(), Ok(DeviceEvent::Attach(_))));
    }

    #[test]
    fn test_register_twice_keeps_one_subscription() {
        let h = Harness::new();
        let (listener, second) = event_channel();
        h.monitor.register(listener).unwrap();

        h.host.plug(create_mock_camera(1));
        h.monitor.flush().unwrap();
        assert!(h.events.try_recv().is_err());
        assert!(matches!(second.try_recv(), Ok(DeviceEvent::Attach(_))));
    }

    #[test]
    fn test_destroy_closes_blocks_and_rejects_calls() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        let block = h.connect(&camera);

        h.monitor.destroy();
        assert!(h.monitor.is_destroyed());
        assert!(!h.monitor.is_registered());
        assert!(block.is_closed());
        assert_eq!(h.host.open_handles(), 0);
        assert!(matches!(h.events.try_recv(), Ok(DeviceEvent::Disconnect { .. })));

        assert!(matches!(h.monitor.register(event_channel().0), Err(Error::AlreadyDestroyed)));
        assert!(matches!(h.monitor.request_permission(&camera), Err(Error::AlreadyDestroyed)));
        assert!(matches!(h.monitor.open_device(&camera), Err(Error::AlreadyDestroyed)));
        assert!(matches!(h.monitor.has_permission(&camera), Err(Error::AlreadyDestroyed)));
        assert!(matches!(h.monitor.device_list(), Err(Error::AlreadyDestroyed)));

        h.monitor.destroy();
    }

    #[test]
    fn test_grant_after_destroy_is_ignored() {
        let h = Harness::new();
        let camera = create_mock_camera(1);
        h.plug(&camera);
        h.monitor.request_permission(&camera).unwrap();
        h.monitor.flush().unwrap();

        h.monitor.destroy();
        h.host.grant(&camera);

        assert!(h.events().is_empty());
        assert_eq!(h.host.open_calls(), 0);
    }

    /// Closes every block it is handed, from inside the callback
    struct ClosingListener {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DeviceListener for ClosingListener {
        fn on_connect(&self, _device: &DeviceDescriptor, block: &ControlBlock, _created_new: bool) {
            self.log.lock().unwrap().push("connect".into());
            block.close();
            self.log.lock().unwrap().push("closed".into());
        }

        fn on_disconnect(&self, _device: &DeviceDescriptor, _block: &ControlBlock) {
            self.log.lock().unwrap().push("disconnect".into());
        }
    }

    #[test]
    fn test_close_from_listener_callback() {
        let host = FakeHost::new();
        let worker = Worker::spawn("monitor-test-reentrant").unwrap();
        let monitor = DeviceMonitor::new(Arc::new(host.clone()), worker.handle(), manual_settings());
        let log = Arc::new(Mutex::new(Vec::new()));
        monitor.register(ClosingListener { log: log.clone() }).unwrap();

        let camera = create_mock_camera(1);
        host.add_device(camera.clone());
        host.set_permission(&camera, true);
        monitor.request_permission(&camera).unwrap();
        monitor.flush().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["connect", "disconnect", "closed"]);
        assert!(monitor.control_block(&camera).is_none());

        monitor.destroy();
        worker.shutdown();
    }
}
