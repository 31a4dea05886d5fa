use std::fs;
use std::path::Path;

use migbench::cpufreq::{FrequencyController, Governor};
use migbench::domain::{CpuId, FrequencyError};

/// Fake cpufreq tree: `count` CPUs with hardware bounds [800000, 3000000] kHz
fn fake_sysfs(count: u32) -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    for cpu in 0..count {
        let dir = root.path().join(format!("cpu{cpu}/cpufreq"));
        fs::create_dir_all(&dir).unwrap();
        for (attr, value) in [
            ("scaling_cur_freq", "2000000"),
            ("cpuinfo_min_freq", "800000"),
            ("cpuinfo_max_freq", "3000000"),
            ("scaling_min_freq", "800000"),
            ("scaling_max_freq", "3000000"),
            ("scaling_governor", "powersave"),
            ("scaling_available_governors", "performance powersave userspace"),
            ("scaling_driver", "intel_cpufreq"),
            ("scaling_setspeed", "<unsupported>"),
        ] {
            fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
    }
    root
}

fn read(root: &Path, attr: &str) -> String {
    fs::read_to_string(root.join("cpu0/cpufreq").join(attr)).unwrap()
}

#[test]
fn test_bound_checks_apply_to_policy_setters_only() {
    let sysfs = fake_sysfs(1);
    let controller = FrequencyController::discover_in(sysfs.path()).unwrap();

    let err = controller.set_max_frequency(CpuId(0), 5_000_000).unwrap_err();
    assert!(matches!(err, FrequencyError::OutOfRange { max: 3_000_000, .. }));
    let err = controller.set_min_frequency(CpuId(0), 5_000_000).unwrap_err();
    assert!(matches!(err, FrequencyError::OutOfRange { .. }));
    assert_eq!(read(sysfs.path(), "scaling_max_freq"), "3000000\n");

    // The fixed-frequency path writes whatever it is given
    controller.set_fixed_frequency(CpuId(0), 5_000_000).unwrap();
    assert_eq!(read(sysfs.path(), "scaling_setspeed"), "5000000");
}

/// SetFixedFrequency(0, 5_000_000) with max 3_000_000: the write is attempted and
/// the reported frequency is whatever the kernel makes of it
#[test]
fn test_scenario_fixed_frequency_above_max() {
    let sysfs = fake_sysfs(1);
    let controller = FrequencyController::discover_in(sysfs.path()).unwrap();

    controller.set_fixed_frequency(CpuId(0), 5_000_000).unwrap();
    assert_eq!(controller.governor(CpuId(0)).unwrap(), Governor::Userspace);

    // Stand in for the kernel clamping the set-point to the hardware maximum
    fs::write(sysfs.path().join("cpu0/cpufreq/scaling_cur_freq"), "3000000\n").unwrap();
    let info = controller.info(CpuId(0)).unwrap();
    assert_eq!(info.current_khz, 3_000_000);
    assert_eq!(info.max_khz, 3_000_000);
}

#[test]
fn test_info_is_reread_on_every_call() {
    let sysfs = fake_sysfs(2);
    let controller = FrequencyController::discover_in(sysfs.path()).unwrap();
    assert_eq!(controller.cpu_count(), 2);

    assert_eq!(controller.info(CpuId(1)).unwrap().governor, Governor::Powersave);
    controller.set_governor(CpuId(1), &Governor::Performance).unwrap();
    assert_eq!(controller.info(CpuId(1)).unwrap().governor, Governor::Performance);
}

#[test]
#[ignore = "requires root and cpufreq with the userspace governor"]
fn test_scenario_fixed_frequency_on_host() {
    let controller = FrequencyController::discover().unwrap();
    let before = controller.info(CpuId(0)).unwrap();

    controller.set_fixed_frequency(CpuId(0), 5_000_000).unwrap();
    let after = controller.info(CpuId(0)).unwrap();
    assert!(after.current_khz <= after.max_khz);

    controller.set_governor(CpuId(0), &before.governor).unwrap();
}
