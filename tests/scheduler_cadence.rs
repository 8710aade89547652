//! Plugin registry behavior: cadence, reload persistence, and convergence
//! of the loaded set to the configured set.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use check_crawler::core::config::Snapshot;
use check_crawler::daemon::loop_main::SchedulerLoop;
use check_crawler::daemon::pids::PidRegistry;
use check_crawler::logger::Logger;
use check_crawler::mail::MemoryMailer;
use check_crawler::plugins::registry::PluginRegistry;

struct Fixture {
    dir: tempfile::TempDir,
    snap: Snapshot,
}

/// Config with a valid plugin-dir and a `marker` plugin section.
fn fixture(extra: &str) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugin_dir = dir.path().join("plugins");
    std::fs::create_dir(&plugin_dir).expect("plugin dir");
    let marker_path = dir.path().join("marker.txt");
    let contents = format!(
        "[crawler]\nplugin-dir = {}\nplugins = \"marker\"\n\n[marker]\npath = {}\n{extra}",
        common::toml_path(&plugin_dir),
        common::toml_path(&marker_path),
    );
    let path = common::write_config(dir.path(), &contents);
    let snap = Snapshot::load(path).expect("load config");
    Fixture { dir, snap }
}

fn registry() -> PluginRegistry {
    PluginRegistry::new(Logger::stderr_only("TEST"))
}

#[test]
fn freshly_loaded_plugin_is_immediately_eligible() {
    let fx = fixture("");
    let mut reg = registry();
    reg.load_or_reload("marker", &fx.snap).unwrap();
    assert!(reg.time_to_fire("marker"));
}

#[test]
fn not_due_again_until_a_full_period_has_passed() {
    let fx = fixture("frequency = \"1h\"\n");
    let mut reg = registry();
    reg.load_or_reload("marker", &fx.snap).unwrap();

    let now = SystemTime::now();
    reg.fire_at("marker", &fx.snap, now).unwrap();
    assert!(!reg.time_to_fire_at("marker", now));
    assert!(!reg.time_to_fire_at("marker", now + Duration::from_secs(3600)));
    assert!(reg.time_to_fire_at("marker", now + Duration::from_secs(3601)));
}

#[test]
fn reload_reinstantiates_but_keeps_cadence_state() {
    let fx = fixture("frequency = \"1h\"\n");
    let mut reg = registry();
    reg.load_or_reload("marker", &fx.snap).unwrap();
    let now = SystemTime::now();
    reg.fire_at("marker", &fx.snap, now).unwrap();

    // Operator edits the cadence; the daemon reloads in place.
    let plugin_dir = fx.dir.path().join("plugins");
    let marker_path = fx.dir.path().join("marker.txt");
    let contents = format!(
        "[crawler]\nplugin-dir = {}\nplugins = \"marker\"\n\n[marker]\npath = {}\nfrequency = \"2h\"\n",
        common::toml_path(&plugin_dir),
        common::toml_path(&marker_path),
    );
    let cfg_path = common::write_config(fx.dir.path(), &contents);
    let snap = Snapshot::load(cfg_path).unwrap();
    reg.load_or_reload("marker", &snap).unwrap();

    let descriptor = reg.descriptor("marker").expect("still loaded");
    assert_eq!(descriptor.frequency(), Duration::from_secs(7200));
    assert_eq!(descriptor.last_fired_at(), now, "cadence must survive reload");
}

#[test]
fn sync_converges_loaded_set_to_configured_set() {
    let fx = fixture("");
    let mut reg = registry();
    reg.sync(&fx.snap).unwrap();
    assert_eq!(reg.loaded_names(), vec!["marker"]);

    // Drop the plugin from the configured list; sync unloads it.
    let plugin_dir = fx.dir.path().join("plugins");
    let contents = format!(
        "[crawler]\nplugin-dir = {}\nplugins = \"\"\n",
        common::toml_path(&plugin_dir),
    );
    let cfg_path = common::write_config(fx.dir.path(), &contents);
    let snap = Snapshot::load(cfg_path).unwrap();
    reg.sync(&snap).unwrap();
    assert!(reg.loaded_names().is_empty());
}

#[test]
fn sync_isolates_a_broken_plugin() {
    let fx = fixture("");
    let plugin_dir = fx.dir.path().join("plugins");
    let marker_path = fx.dir.path().join("marker.txt");
    let contents = format!(
        "[crawler]\nplugin-dir = {}\nplugins = \"no_such_plugin, marker\"\n\n[marker]\npath = {}\n",
        common::toml_path(&plugin_dir),
        common::toml_path(&marker_path),
    );
    let cfg_path = common::write_config(fx.dir.path(), &contents);
    let snap = Snapshot::load(cfg_path).unwrap();

    let mut reg = registry();
    reg.sync(&snap).unwrap();
    assert_eq!(
        reg.loaded_names(),
        vec!["marker"],
        "the unknown plugin must not keep marker from loading"
    );
}

#[test]
fn non_firable_plugin_declines_without_stamping() {
    let fx = fixture("fire = \"no\"\n");
    let mut reg = registry();
    reg.load_or_reload("marker", &fx.snap).unwrap();
    let before = reg.descriptor("marker").unwrap().last_fired_at();

    reg.fire("marker", &fx.snap).unwrap();
    assert!(
        !fx.dir.path().join("marker.txt").exists(),
        "a non-firable plugin must not run"
    );
    assert_eq!(reg.descriptor("marker").unwrap().last_fired_at(), before);
}

#[test]
fn verbose_stamps_a_declined_fire() {
    let fx = fixture("fire = \"no\"\n");
    let mut reg = registry();
    reg.set_verbose(true);
    reg.load_or_reload("marker", &fx.snap).unwrap();

    let now = SystemTime::now();
    reg.fire_at("marker", &fx.snap, now).unwrap();
    assert!(
        !fx.dir.path().join("marker.txt").exists(),
        "verbose must not make a non-firable plugin run"
    );
    // The decline is stamped so it is not re-evaluated every tick.
    assert_eq!(reg.descriptor("marker").unwrap().last_fired_at(), now);
}

#[test]
fn verbose_config_option_reaches_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("plugins");
    std::fs::create_dir(&plugin_dir).unwrap();
    let contents = format!(
        "[crawler]\nplugin-dir = {}\nexitpath = {}\nplugins = \"\"\nverbose = \"yes\"\n",
        common::toml_path(&plugin_dir),
        common::toml_path(&dir.path().join("exit")),
    );
    let cfg_path = common::write_config(dir.path(), &contents);
    let snap = Snapshot::load(cfg_path).unwrap();

    let mut scheduler = SchedulerLoop::new(
        snap,
        "TEST",
        PidRegistry::new(dir.path().join("pids")),
        Logger::stderr_only("TEST"),
        Arc::new(MemoryMailer::new()),
    )
    .unwrap();
    assert!(scheduler.registry_mut().verbose());
}

#[test]
fn unknown_plugin_is_an_import_error() {
    let fx = fixture("");
    let mut reg = registry();
    let err = reg.load_or_reload("no_such_plugin", &fx.snap).unwrap_err();
    assert_eq!(err.code(), "CRW-2002");
}

#[test]
fn unusable_plugin_dir_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let contents = format!(
        "[crawler]\nplugin-dir = {}\nplugins = \"marker\"\n",
        common::toml_path(&dir.path().join("missing")),
    );
    let cfg_path = common::write_config(dir.path(), &contents);
    let snap = Snapshot::load(cfg_path).unwrap();

    let mut reg = registry();
    let err = reg.load_or_reload("marker", &snap).unwrap_err();
    assert_eq!(err.code(), "CRW-2001");
    let err = reg.sync(&snap).unwrap_err();
    assert_eq!(err.code(), "CRW-2001");
}
