//! Workbench lifecycle against a configuration file on disk
//!
//! A workbench is process-wide, so this binary holds a single test.

use labwire::{ConfigStore, Workbench, WorkbenchError};
use std::io::Write;

const MODEL: &str = "\
Device:
  name: rig
  interfaces:
    Serial:
      name: UART
      port: /dev/ttyUSB7
      baudrate: 9600
";

#[test]
fn workbench_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("labwire.toml");

    let bench = Workbench::open(&config_path).unwrap();
    assert!(config_path.is_file());
    assert!(matches!(Workbench::new(), Err(WorkbenchError::AlreadyRunning)));

    // Defaults were written to the new file
    let written = ConfigStore::load(&config_path).unwrap();
    assert!(written.get_entry("Logger", "level").is_ok());
    assert!(written.get_entry("Session", "read_timeout_ms").is_ok());
    assert_eq!(
        bench.settings().session.read_timeout_ms,
        written.get_as::<u64>("Session", "read_timeout_ms").unwrap()
    );

    let model_path = dir.path().join("rig.yaml");
    std::fs::File::create(&model_path)
        .unwrap()
        .write_all(MODEL.as_bytes())
        .unwrap();

    let rig = bench.load_file(&model_path).unwrap();
    assert_eq!(rig.name(), "rig");
    assert_eq!(rig.transport_names(), vec!["UART"]);
    let uart = rig.transport("UART").unwrap();
    assert!(!uart.is_connected().unwrap());

    let resolved = bench.resolve(uart.uid()).unwrap();
    assert_eq!(resolved.uid(), uart.uid());
    assert!(resolved.into_transport().is_some());

    let uid = rig.uid();
    drop(rig);
    let report = bench.verify();
    assert_eq!(report.evicted.len(), 2);
    assert!(bench.resolve(uid).is_err());

    drop(bench);
    assert!(!Workbench::is_running());

    // An existing file is read, not overwritten
    std::fs::write(&config_path, "[Session]\nread_timeout_ms = 40\n").unwrap();
    let bench = Workbench::open(&config_path).unwrap();
    assert_eq!(bench.settings().session.read_timeout_ms, 40);
    let on_disk = std::fs::read_to_string(&config_path).unwrap();
    assert_eq!(on_disk, "[Session]\nread_timeout_ms = 40\n");
}
