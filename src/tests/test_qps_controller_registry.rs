use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use super::fixtures::{manual_clock, registry};
use crate::{ConfigChange, FlowDirection, GLOBAL_KEY, KeyResolver, QualifiedKey};

const LIMIT_PREFIX: &str = "flowcontrol.consumer.qps.limit.";
const GLOBAL_LIMIT: &str = "flowcontrol.consumer.qps.global.limit";

fn set_limit(key: &str, limit: i64) -> ConfigChange {
    ConfigChange::set(format!("{LIMIT_PREFIX}{key}"), limit)
}

#[test]
fn get_or_create_returns_same_instance() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    let key = QualifiedKey::microservice("ms");

    let first = registry.get_or_create(&key);
    let second = registry.get_or_create(&key);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[test]
fn unconfigured_key_is_unlimited() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);

    let controller = registry.get_or_create(&QualifiedKey::operation("ms", "s", "o"));

    assert_eq!(controller.limit(), 0);
    for _ in 0..1000 {
        assert!(controller.try_admit());
    }
}

#[test]
fn new_controller_is_seeded_from_fallback_chain() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);

    registry.apply(&ConfigChange::set(GLOBAL_LIMIT, 30));
    registry.apply(&set_limit("ms.s", 7));

    assert_eq!(
        registry
            .get_or_create(&QualifiedKey::operation("ms", "s", "o"))
            .limit(),
        7
    );
    assert_eq!(
        registry.get_or_create(&QualifiedKey::microservice("ms")).limit(),
        30
    );
}

#[test]
fn resolve_uses_most_specific_configured_key() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    let candidates = KeyResolver::candidates(Some("ms"), Some("s"), Some("o"));

    assert_eq!(registry.governing_key(&candidates).as_str(), GLOBAL_KEY);

    registry.apply(&set_limit("ms", 10));
    assert_eq!(registry.governing_key(&candidates).as_str(), "ms");

    registry.apply(&set_limit("ms.s.o", 1));
    assert_eq!(registry.resolve(&candidates).key().as_str(), "ms.s.o");
}

#[test]
fn operations_share_schema_level_controller() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&set_limit("ms.s", 2));

    let a = registry.resolve(&KeyResolver::candidates(Some("ms"), Some("s"), Some("a")));
    let b = registry.resolve(&KeyResolver::candidates(Some("ms"), Some("s"), Some("b")));

    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.try_admit());
    assert!(b.try_admit());
    assert!(!a.try_admit());
}

#[test]
fn configuration_change_updates_existing_controller_in_place() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&set_limit("ms", 5));

    let controller = registry.get_or_create(&QualifiedKey::microservice("ms"));
    for _ in 0..3 {
        assert!(controller.try_admit());
    }

    registry.on_configuration_changed("ms", Some(2));

    let again = registry.get_or_create(&QualifiedKey::microservice("ms"));
    assert!(Arc::ptr_eq(&controller, &again));
    assert_eq!(again.limit(), 2);
    assert_eq!(again.state().admitted, 3);
    assert!(!again.try_admit());
}

#[test]
fn configuration_change_without_controller_only_updates_snapshot() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);

    registry.on_configuration_changed("ms", Some(4));

    assert!(registry.is_empty());
    assert_eq!(registry.config().explicit_limit("ms"), Some(4));
    assert_eq!(
        registry.get_or_create(&QualifiedKey::microservice("ms")).limit(),
        4
    );
}

#[test]
fn removing_limit_falls_back_for_existing_controller() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&ConfigChange::set(GLOBAL_LIMIT, 9));
    registry.apply(&set_limit("ms", 3));

    let controller = registry.get_or_create(&QualifiedKey::microservice("ms"));
    assert_eq!(controller.limit(), 3);

    registry.apply(&ConfigChange::removed(format!("{LIMIT_PREFIX}ms")));
    assert_eq!(controller.limit(), 9);

    registry.apply(&ConfigChange::removed(GLOBAL_LIMIT));
    assert_eq!(controller.limit(), 0);
}

#[test]
fn ancestor_change_propagates_to_seeded_descendants() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&set_limit("ms", 3));

    let operation = registry.get_or_create(&QualifiedKey::operation("ms", "s", "o"));
    assert_eq!(operation.limit(), 3);

    registry.apply(&set_limit("ms", 8));
    assert_eq!(operation.limit(), 8);
}

#[test]
fn invalid_limit_value_degrades_to_unlimited() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&set_limit("ms", 1));

    let controller = registry.get_or_create(&QualifiedKey::microservice("ms"));
    assert_eq!(controller.limit(), 1);

    assert!(registry.apply(&ConfigChange::set(
        format!("{LIMIT_PREFIX}ms"),
        "not-a-number"
    )));

    assert_eq!(registry.config().explicit_limit("ms"), None);
    assert_eq!(controller.limit(), 0);
}

#[test]
fn apply_ignores_foreign_properties() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);

    assert!(!registry.apply(&ConfigChange::set(
        "flowcontrol.provider.qps.limit.ms",
        1
    )));
    assert!(!registry.apply(&ConfigChange::set("other.setting", "x")));
    assert!(registry.config().is_empty());
}

#[test]
fn enabled_flag_parses_booleans() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    let enabled = "flowcontrol.consumer.qps.enabled";

    registry.apply(&ConfigChange::set(enabled, false));
    assert!(!registry.is_enabled());

    registry.apply(&ConfigChange::set(enabled, "garbage"));
    assert!(registry.is_enabled());

    registry.apply(&ConfigChange::set(enabled, false));
    registry.apply(&ConfigChange::removed(enabled));
    assert!(registry.is_enabled());
}

#[test]
fn load_replaces_snapshot_wholesale() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&set_limit("old", 1));

    let controller = registry.get_or_create(&QualifiedKey::microservice("old"));
    assert_eq!(controller.limit(), 1);

    registry.load(&[set_limit("new", 2), ConfigChange::set(GLOBAL_LIMIT, 50)]);

    assert_eq!(registry.config().explicit_limit("old"), None);
    assert_eq!(registry.config().explicit_limit("new"), Some(2));
    assert_eq!(controller.limit(), 50);
}

#[test]
fn reset_all_clears_controllers_but_keeps_config() {
    let clock = manual_clock();
    let registry = registry(FlowDirection::Consumer, &clock);
    registry.apply(&set_limit("ms", 1));

    let before = registry.get_or_create(&QualifiedKey::microservice("ms"));
    assert!(before.try_admit());

    registry.reset_all();
    assert!(registry.is_empty());

    let after = registry.get_or_create(&QualifiedKey::microservice("ms"));
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.try_admit());
}

#[test]
fn concurrent_first_access_installs_single_controller() {
    let clock = manual_clock();
    let registry = Arc::new(registry(FlowDirection::Consumer, &clock));
    let barrier = Arc::new(Barrier::new(16));
    let key = QualifiedKey::operation("brand", "new", "key");

    let threads: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let key = key.clone();

            thread::spawn(move || {
                barrier.wait();
                registry.get_or_create(&key)
            })
        })
        .collect();

    let controllers: Vec<_> = threads
        .into_iter()
        .map(|t| t.join().expect("thread panicked"))
        .collect();

    assert_eq!(registry.len(), 1);
    assert!(
        controllers
            .iter()
            .all(|controller| Arc::ptr_eq(controller, &controllers[0]))
    );
}

#[test]
fn concurrent_reload_never_lifts_configured_limit() {
    let clock = manual_clock();
    let registry = Arc::new(registry(FlowDirection::Consumer, &clock));
    let config = [set_limit("pojo.server.opr", 1)];
    registry.load(&config);

    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(2));

    let admitting = {
        let registry = registry.clone();
        let done = done.clone();
        let barrier = barrier.clone();

        thread::spawn(move || {
            let candidates = KeyResolver::candidates(Some("pojo"), Some("server"), Some("opr"));
            let mut admitted = 0;

            barrier.wait();
            while !done.load(Ordering::Acquire) {
                if registry.resolve(&candidates).try_admit() {
                    admitted += 1;
                }
            }

            admitted
        })
    };

    barrier.wait();
    for _ in 0..5_000 {
        registry.load(&config);
    }
    done.store(true, Ordering::Release);

    let admitted = admitting.join().expect("thread panicked");

    assert_eq!(admitted, 1);
    assert_eq!(registry.keys(), vec!["pojo.server.opr".to_string()]);
}

#[test]
fn concurrent_config_writers_leave_effective_limits() {
    let clock = manual_clock();
    let registry = Arc::new(registry(FlowDirection::Consumer, &clock));
    let keys = [
        QualifiedKey::operation("ms", "s", "o"),
        QualifiedKey::schema("ms", "s"),
        QualifiedKey::microservice("ms"),
        QualifiedKey::global(),
    ];
    let controllers: Vec<_> = keys.iter().map(|key| registry.get_or_create(key)).collect();

    let barrier = Arc::new(Barrier::new(4));
    let threads: Vec<_> = ["ms.s.o", "ms.s", "ms", GLOBAL_KEY]
        .into_iter()
        .enumerate()
        .map(|(i, key)| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let base = (i as i64 + 1) * 1000;

            thread::spawn(move || {
                barrier.wait();
                for n in 0..500 {
                    let limit = if n % 3 == 0 { None } else { Some(base + n) };
                    registry.on_configuration_changed(key, limit);
                }
                registry.on_configuration_changed(key, Some(base));
            })
        })
        .collect();

    for t in threads {
        t.join().expect("thread panicked");
    }

    for controller in &controllers {
        assert_eq!(
            controller.limit(),
            registry.config().effective_limit(controller.key())
        );
    }
    assert_eq!(controllers[0].limit(), 1000);
    assert_eq!(controllers[3].limit(), 4000);
}

#[test]
fn concurrent_reload_and_apply_agree_with_snapshot() {
    let clock = manual_clock();
    let registry = Arc::new(registry(FlowDirection::Consumer, &clock));
    let controller = registry.get_or_create(&QualifiedKey::microservice("ms"));
    let barrier = Arc::new(Barrier::new(2));

    let loading = {
        let registry = registry.clone();
        let barrier = barrier.clone();

        thread::spawn(move || {
            barrier.wait();
            for n in 0..500 {
                registry.load(&[ConfigChange::set(GLOBAL_LIMIT, 10 + n)]);
            }
        })
    };

    barrier.wait();
    for n in 0..500 {
        registry.apply(&set_limit("ms", 5 + n));
    }

    loading.join().expect("thread panicked");

    assert_eq!(
        controller.limit(),
        registry.config().effective_limit(controller.key())
    );
}
