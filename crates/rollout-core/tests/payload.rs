mod common;

use std::sync::Arc;

use rollout_core::installer::{InstallerAssembler, TrailerResourceEditor};

use common::{StubTools, write_package};

#[tokio::test]
async fn identical_inputs_give_identical_payload_zips() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let package = write_package(temp.path(), "app", "3.1.4", "-full", b"application bytes");
    let updater = temp.path().join("Update.exe");
    std::fs::write(&updater, b"updater binary").expect("updater written");
    let gif = temp.path().join("loading.gif");
    std::fs::write(&gif, b"GIF89a").expect("gif written");
    let assembler = InstallerAssembler::new(
        Arc::new(StubTools::default()),
        Arc::new(TrailerResourceEditor),
    );

    let first = assembler
        .build_payload_zip(&package, &updater, Some(&gif), None)
        .await
        .expect("first payload should build");
    // Cross a zip timestamp tick so unnormalised times would differ.
    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    let second = assembler
        .build_payload_zip(&package, &updater, Some(&gif), None)
        .await
        .expect("second payload should build");

    assert_ne!(first.to_path_buf(), second.to_path_buf());
    assert_eq!(
        std::fs::read(&first).expect("first readable"),
        std::fs::read(&second).expect("second readable")
    );
}

#[tokio::test]
async fn payload_zip_is_removed_when_dropped() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let package = write_package(temp.path(), "app", "1.0.0", "-full", b"bytes");
    let updater = temp.path().join("Update.exe");
    std::fs::write(&updater, b"updater").expect("updater written");
    let assembler = InstallerAssembler::new(
        Arc::new(StubTools::default()),
        Arc::new(TrailerResourceEditor),
    );

    let zip = assembler
        .build_payload_zip(&package, &updater, None, None)
        .await
        .expect("payload should build");
    let path = zip.to_path_buf();
    assert!(path.exists());

    drop(zip);
    assert!(!path.exists());
}
