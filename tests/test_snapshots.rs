use std::fs;

use native_crash_report::{
    build_report, format_stack, Addr, CrashReport, RawDump, ThreadRecord,
};

fn load_fixture(name: &str) -> RawDump {
    let bytes = fs::read(format!("tests/fixtures/{}.json", name)).unwrap();
    RawDump::from_slice(&bytes).unwrap()
}

fn crashed(report: &CrashReport) -> &ThreadRecord {
    report.crashed_thread().expect("no crashed thread")
}

#[test]
fn test_segv() {
    let dump = load_fixture("segv");
    let report = build_report(&dump, None);

    assert_eq!(report.threads.len(), 1);
    assert_eq!(report.modules.len(), 2);
    assert_eq!(report.signal.name, "SIGSEGV");
    assert_eq!(report.signal.code, "0x1");
    assert_eq!(report.signal.fault_address, Addr(0xdead));
    assert_eq!(report.exception_type(), "SIGSEGV");
    assert!(report.exception.is_none());

    assert_eq!(report.app_identifier, "com.example.demo");
    assert_eq!(report.app_version, "42");
    assert_eq!(report.app_marketing_version, "1.4.0");
    assert_eq!(report.process_id, 812);
    assert_eq!(report.process_name, "Demo");
    assert_eq!(report.parent_process_id, 1);
    assert_eq!(report.parent_process_name, "launchd");
    assert_eq!(report.launch_time, 1705313920.25);
    assert!(report.is_64_bit);
    assert_eq!(report.os_version, "17.2");
    assert_eq!(report.os_build, "21C62");
    assert_eq!(report.machine_model, "iPhone15,2");

    let thread = crashed(&report);
    assert_eq!(thread.frames.len(), 3);
    assert_eq!(thread.registers.len(), 6);

    let stack = format_stack(thread, &dump);
    assert_eq!(stack.lines().count(), 3);
    for (idx, line) in stack.lines().enumerate() {
        assert!(line.starts_with(&format!("{} ", idx)));
    }
    insta::assert_snapshot!(stack, @r###"
    0   libsystem_kernel.dylib              0x00000001b0001a2c __pthread_kill + 8
    1   Demo                                0x0000000100004f10 -[ViewController crash] + 32
    2   Demo                                0x0000000100005188 0x100000000 + 20872
    "###);
}

#[test]
fn test_segv_modules() {
    let dump = load_fixture("segv");
    let report = build_report(&dump, None);

    let modules: Vec<_> = report.modules.iter().collect();
    assert_eq!(modules[0].name, "libsystem_kernel.dylib");
    assert_eq!(modules[0].build_id, "6DECCEE4-A052-3EA4-BB67-957B06F53AD1");
    assert_eq!(modules[0].architecture, "arm64e");
    assert!(!modules[0].is_user_code);
    assert_eq!(modules[1].name, "Demo");
    assert_eq!(modules[1].build_id, "2D903291-397D-3D14-BFCA-52C7FB8C5E00");
    assert_eq!(modules[1].base_address, Addr(0x100000000));
    assert!(modules[1].is_user_code);

    let thread = crashed(&report);
    assert_eq!(
        thread.frames[0].image.as_deref(),
        Some("/usr/lib/system/libsystem_kernel.dylib")
    );
    assert!(report
        .modules
        .get(thread.frames[2].image.as_deref().unwrap())
        .is_some());
}

#[test]
fn test_objc_exception() {
    let dump = load_fixture("objc_exception");
    let report = build_report(&dump, dump.session_id().as_deref());

    assert_eq!(report.exception_type(), "NSInvalidArgumentException");
    assert_eq!(report.signal.name, "SIGABRT");
    let exception = report.exception.as_ref().unwrap();
    assert_eq!(exception.frames.len(), 5);
    assert_eq!(
        exception.reason,
        "-[__NSCFNumber length]: unrecognized selector sent to instance 0x8000000000000000"
    );
    assert_eq!(report.mach_exception.as_ref().unwrap().exception_type, 6);

    let indexes: Vec<_> = report.threads.iter().map(|t| t.index).collect();
    assert_eq!(indexes, [0, 1, 3]);
    assert_eq!(report.threads[2].frames.len(), 1);

    let names: Vec<_> = report.modules.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "libsystem_kernel.dylib",
            "CoreFoundation",
            "UIKitCore",
            "Demo",
            "libc++abi.dylib",
            "libobjc.A.dylib",
        ]
    );

    assert_eq!(report.session_id.as_deref(), Some("7c0a1f52-rum-session"));
    assert_eq!(report.app_marketing_version, "???");
    assert_eq!(report.parent_process_name, "???");
    assert_eq!(report.launch_time, 0.0);

    let thread = crashed(&report);
    assert_eq!(thread.index, 1);
    assert!(thread.frames[3].image.is_none());
    assert_eq!(thread.frames[3].instruction_address, Addr(0x10));

    insta::assert_snapshot!(format_stack(thread, &dump), @r###"
    0   libsystem_kernel.dylib              0x00000001b0005e10 __pthread_kill + 8
    1   libc++abi.dylib                     0x00000001a0000400 0x1a0000000 + 1024
    2   libobjc.A.dylib                     0x0000000190002c0c 0x190000000 + 11276
    3   ???                                 0x0000000000000010 0x0 + 16
    "###);
}

#[test]
fn test_report_round_trip() {
    for name in &["segv", "objc_exception"] {
        let dump = load_fixture(name);
        let report = build_report(&dump, Some("session"));
        let json = report.to_json_pretty().unwrap();
        let parsed: CrashReport = json.parse().unwrap();
        assert_eq!(parsed, report);
        assert_eq!(parsed.to_json_pretty().unwrap(), json);
    }
}

#[test]
fn test_serialized_shape() {
    let dump = load_fixture("segv");
    let report = build_report(&dump, None);
    let value: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();

    assert_eq!(
        value["signal"],
        serde_json::json!({
            "name": "SIGSEGV",
            "code": "0x1",
            "fault_address": "0xdead",
        })
    );
    assert_eq!(value["timestamp"], "2024-01-15T10:20:30Z");
    assert_eq!(value["incident_id"], report.incident_id.to_string());
    assert!(value.get("exception").is_none());
    assert!(value.get("session_id").is_none());
    assert_eq!(
        value["threads"][0]["frames"][2],
        serde_json::json!({
            "instruction_address": "0x100005188",
            "image": "/private/var/containers/Bundle/Application/5E2B3C1A-0F7D-4C4E-9A55-2B8D3E1F6A70/Demo.app/Demo",
        })
    );
    assert_eq!(
        value["threads"][0]["registers"][1],
        serde_json::json!({"name": "x1", "value": "0xdead"})
    );
    assert_eq!(value["modules"].as_array().map(Vec::len), Some(2));
}
