//! Model loading, identity and registry behavior through the public API

use bytes::Bytes;
use labwire::capability::CapabilitySet;
use labwire::{
    BuildError, Builder, CapabilityError, CapabilityRegistry, DeviceError, Registry, RegistryError,
    SessionSettings, Transport, TransportError, TransportKind, TransportStats, Uid,
};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

/// In-memory transport answering each write with the same bytes
#[derive(Default)]
struct Mirror {
    connected: bool,
    queued: VecDeque<Bytes>,
}

impl Transport for Mirror {
    fn kind(&self) -> TransportKind {
        TransportKind::Custom
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self) -> Result<Bytes, TransportError> {
        Ok(self.queued.pop_front().unwrap_or_default())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.queued.push_back(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    fn connection_info(&self) -> String {
        "mirror".to_string()
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

fn builder() -> Builder {
    let capabilities = CapabilityRegistry::with_builtins();
    capabilities
        .register_transport(
            "Mirror",
            |_, _| Ok(Box::new(Mirror::default()) as Box<dyn Transport>),
            CapabilitySet::with_description("in-memory mirror"),
        )
        .unwrap();
    Builder::new(
        Arc::new(Registry::new()),
        Arc::new(capabilities),
        SessionSettings::default(),
    )
}

const TWO_TRANSPORTS: &str = "\
Device:
  name: dut
  id: 3
  model: X-100
  firmware: 1.2.3
  interfaces:
    Mirror:
      name: CONSOLE
    debug:
      type: Mirror
      name: DEBUG
";

#[test]
fn round_trip_names_and_owners() {
    let builder = builder();
    let device = builder.load_str(TWO_TRANSPORTS).unwrap();

    let mut names = device.transport_names();
    names.sort();
    assert_eq!(names, vec!["CONSOLE", "DEBUG"]);

    for name in ["CONSOLE", "DEBUG"] {
        let view = device.transport(name).unwrap();
        assert_eq!(view.duid().unwrap(), Some(device.uid()));
    }

    assert_eq!(device.id(), 3);
    assert_eq!(device.model(), "X-100");
    assert!(device.fields().extra("firmware").is_some());
}

#[test]
fn identities_are_unique_and_increasing() {
    let builder = builder();
    let mut issued: Vec<Uid> = Vec::new();
    let mut devices = Vec::new();
    for _ in 0..20 {
        let device = builder.load_str(TWO_TRANSPORTS).unwrap();
        issued.push(device.uid());
        issued.extend(device.transport_uids());
        devices.push(device);
    }

    assert_eq!(issued.len(), 60);
    assert!(issued.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(builder.registry().len(), 60);
}

#[test]
fn concurrent_loads_keep_registry_consistent() {
    const THREADS: usize = 8;
    const LOADS: usize = 25;

    let builder = builder();
    let graphs: Vec<(Uid, Vec<Uid>, labwire::DeviceHandle)> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    (0..LOADS)
                        .map(|_| {
                            let device = builder.load_str(TWO_TRANSPORTS).unwrap();
                            (device.uid(), device.transport_uids(), device)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect()
    });

    let mut issued = Vec::new();
    for (device_uid, transport_uids, _) in &graphs {
        assert_eq!(transport_uids.len(), 2);
        assert!(transport_uids.iter().all(|t| t > device_uid));
        issued.push(*device_uid);
        issued.extend(transport_uids);
    }
    let total = THREADS * LOADS * 3;
    issued.sort();
    issued.dedup();
    assert_eq!(issued.len(), total);

    let registry = builder.registry();
    assert_eq!(registry.len(), total);
    assert!(registry.verify_registry().is_clean());
}

#[test]
fn cascading_delete_removes_every_entry() {
    let builder = builder();
    let device = builder.load_str(TWO_TRANSPORTS).unwrap();
    let registry = Arc::clone(builder.registry());

    let mut uids = device.transport_uids();
    uids.push(device.uid());
    let before = registry.len();

    assert_eq!(device.remove().unwrap(), 3);
    assert_eq!(registry.len(), before - 3);
    for uid in uids {
        assert!(matches!(registry.resolve(uid), Err(RegistryError::UnknownIdentity(_))));
    }
}

#[test]
fn duplicate_transport_names_rejected() {
    let builder = builder();
    let err = builder
        .load_str("Device:\n  interfaces:\n    Mirror:\n      name: A\n    other:\n      type: Mirror\n      name: A\n")
        .unwrap_err();

    assert!(matches!(err, BuildError::Device(DeviceError::DuplicateTransport { .. })));
    assert!(builder.registry().is_empty());
}

#[test]
fn unknown_types_leave_registry_untouched() {
    let builder = builder();
    let _kept = builder.load_str(TWO_TRANSPORTS).unwrap();
    let before = builder.registry().len();

    let err = builder.load_str("Oscilloscope:\n  name: scope\n").unwrap_err();
    assert!(matches!(err, BuildError::Capability(CapabilityError::UnknownType(t)) if t == "Oscilloscope"));

    let err = builder
        .load_str("Device:\n  interfaces:\n    Mirror:\n    Gpib:\n      address: 5\n")
        .unwrap_err();
    assert!(matches!(err, BuildError::Capability(CapabilityError::UnknownType(t)) if t == "Gpib"));

    assert_eq!(builder.registry().len(), before);
}

#[test]
fn multiple_roots_rejected() {
    let err = builder()
        .load_str("Device:\n  name: a\nOther:\n  name: b\n")
        .unwrap_err();
    assert!(matches!(err, BuildError::Model(labwire::ModelError::MultipleRoots(_))));
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TWO_TRANSPORTS.as_bytes()).unwrap();

    let builder = builder();
    let device = builder.load(file.path()).unwrap();
    assert_eq!(device.name(), "dut");

    let entry = builder.registry().entry(device.uid()).unwrap();
    assert_eq!(entry.source_label, file.path().display().to_string());
}

#[test]
fn file_errors() {
    let dir = tempfile::tempdir().unwrap();
    let builder = builder();

    assert!(matches!(builder.load_file(dir.path()), Err(BuildError::IsADirectory(_))));
    assert!(matches!(
        builder.load_file(dir.path().join("missing.yaml")),
        Err(BuildError::NotFound(_))
    ));
}

#[test]
fn views_invalidate_after_drop_and_verify() {
    let builder = builder();
    let registry = Arc::clone(builder.registry());
    let device = builder.load_str(TWO_TRANSPORTS).unwrap();
    let device_view = device.view();
    let console = device.transport("CONSOLE").unwrap();

    console.connect().unwrap();
    console.write(b"hello").unwrap();
    assert_eq!(console.read().unwrap(), Bytes::from_static(b"hello"));

    drop(device);
    assert!(!device_view.is_alive());
    assert!(matches!(console.read(), Err(labwire::HandleError::Registry(RegistryError::InstanceDropped(_)))));

    let report = registry.verify_registry();
    assert_eq!(report.evicted.len(), 3);
    assert!(registry.is_empty());
    assert!(matches!(device_view.name(), Err(RegistryError::UnknownIdentity(_))));
}

#[test]
fn resolve_identity_by_reference() {
    let builder = builder();
    let registry = builder.registry();
    let device = builder.load_str(TWO_TRANSPORTS).unwrap();

    assert_eq!(registry.resolve_identity(device.device()).unwrap(), device.uid());
    let node = device.device().transport("DEBUG").unwrap();
    assert_eq!(registry.resolve_identity(&node).unwrap(), node.uid().unwrap());

    registry.remove_transport_by_ref(&node).unwrap();
    assert!(device.transport("DEBUG").is_err());
    assert_eq!(device.transport_names(), vec!["CONSOLE"]);
}
