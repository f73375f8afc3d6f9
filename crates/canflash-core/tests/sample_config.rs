//! The shipped board catalog stays loadable

use std::path::{Path, PathBuf};

use canflash_core::{FlashConfig, TransportConfig};
use pretty_assertions::assert_eq;

fn sample_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/canflash.toml")
}

#[test]
fn sample_catalog_loads() {
    let config = FlashConfig::load(sample_path()).unwrap();

    assert!(matches!(config.transport, TransportConfig::SocketCan(_)));
    assert_eq!(config.boards.len(), 6);
    assert_eq!(config.groups["quadruna"].len(), 5);
}

#[test]
fn sample_catalog_resolves_groups_with_layouts() {
    let config = FlashConfig::load(sample_path()).unwrap();

    let targets = config.resolve_targets(&["quadruna".to_string()]).unwrap();
    let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["VC", "BMS", "FSM", "RSM", "CRIT"]);
    assert!(targets.iter().all(|t| t.mcu.is_some()));
    let commit_ids: Vec<Option<u32>> = targets.iter().map(|t| t.commit_id).collect();
    assert_eq!(
        commit_ids,
        vec![Some(204), Some(140), Some(302), Some(419), Some(506)]
    );

    let dev = config.resolve_targets(&["dev".to_string()]).unwrap();
    assert_eq!(dev[0].request_id, 1300);
    assert_eq!(dev[0].response_id, 1301);
    assert_eq!(dev[0].commit_id, None);
    assert_eq!(
        dev[0].artifact.as_deref(),
        Some(Path::new(
            "build_fw_deploy/firmware/dev/h7dev/h7dev_app_metadata.hex"
        ))
    );
}
