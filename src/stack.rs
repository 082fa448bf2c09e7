//! Legacy plain-text rendering of a crashed thread.
use crate::extract::{Frame, ThreadRecord};
use crate::image::resolve;
use crate::raw::RawDump;

/// Width of the module name column; longer names are cut.
pub const MODULE_COLUMN: usize = 35;

/// Renders the frames of `thread` one per line:
///
/// ```text
/// 0   Demo                                0x0000000100004010 main + 16
/// 1   libsystem_c.dylib                   0x00000001800120a4 0x180000000 + 73892
/// ```
pub fn format_stack(thread: &ThreadRecord, dump: &RawDump) -> String {
    thread
        .frames
        .iter()
        .enumerate()
        .map(|(idx, frame)| format_frame(idx, frame, dump))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_frame(idx: usize, frame: &Frame, dump: &RawDump) -> String {
    let addr = frame.instruction_address.0;
    let image = resolve(addr, dump);
    let module: String = match image {
        Some(ref image) => image.name.chars().take(MODULE_COLUMN).collect(),
        None => "???".to_string(),
    };
    let description = match frame.symbol {
        Some(ref symbol) if symbol.start_address.0 <= addr => {
            format!("{} + {}", symbol.name, addr - symbol.start_address.0)
        }
        _ => {
            let base = image.map_or(0, |image| image.base_address.0);
            format!("0x{:x} + {}", base, addr - base)
        }
    };
    format!(
        "{:<3} {:<width$} 0x{:016x} {}",
        idx,
        module,
        addr,
        description,
        width = MODULE_COLUMN
    )
}

#[test]
fn test_format_stack_lines() {
    use crate::extract::Extractor;

    let dump: RawDump = r#"{
        "signal": {"name": "SIGABRT", "code": "0", "address": 0},
        "threads": [{
            "index": 0,
            "crashed": true,
            "frames": [
                {"pc": 4294983696, "symbol": {"name": "main", "start_address": 4294983680}},
                {"pc": 6442524836},
                {"pc": 48879}
            ]
        }],
        "images": [
            {"base_address": 4294967296, "size": 65536, "path": "/Applications/Demo.app/Contents/MacOS/Demo"},
            {"base_address": 6442450944, "size": 1048576, "path": "/usr/lib/system/libsystem_c.dylib"}
        ]
    }"#
    .parse()
    .unwrap();

    let thread = Extractor::new(&dump).extract_thread(&dump.threads[0]);
    let text = format_stack(&thread, &dump);
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "0   Demo                                0x0000000100004010 main + 16"
    );
    assert_eq!(
        lines[1],
        "1   libsystem_c.dylib                   0x00000001800120a4 0x180000000 + 73892"
    );
    assert_eq!(
        lines[2],
        "2   ???                                 0x000000000000beef 0x0 + 48879"
    );
}

#[test]
fn test_long_module_names_are_cut() {
    use crate::extract::Extractor;

    let dump: RawDump = r#"{
        "signal": {"name": "SIGABRT", "code": "0", "address": 0},
        "threads": [{"index": 3, "frames": [{"pc": 4128}]}],
        "images": [
            {"base_address": 4096, "size": 4096, "path": "/usr/lib/libAVeryLongModuleNameThatDoesNotFitTheColumn.dylib"}
        ]
    }"#
    .parse()
    .unwrap();

    let thread = Extractor::new(&dump).extract_thread(&dump.threads[0]);
    assert_eq!(
        format_stack(&thread, &dump),
        "0   libAVeryLongModuleNameThatDoesNotFi 0x0000000000001020 0x1000 + 32"
    );
}

#[test]
fn test_deep_stacks_keep_the_index_column() {
    use crate::extract::Extractor;

    let frames: Vec<String> = (0..1002)
        .map(|i| format!(r#"{{"pc": {}}}"#, 4096 + i))
        .collect();
    let dump: RawDump = format!(
        r#"{{
            "signal": {{"name": "SIGSEGV", "code": "0", "address": 0}},
            "threads": [{{"index": 0, "crashed": true, "frames": [{}]}}],
            "images": [{{"base_address": 4096, "size": 4096, "path": "/usr/lib/libc.dylib"}}]
        }}"#,
        frames.join(",")
    )
    .parse()
    .unwrap();

    let thread = Extractor::new(&dump).extract_thread(&dump.threads[0]);
    let text = format_stack(&thread, &dump);
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 1002);
    for (idx, line) in lines.iter().enumerate() {
        assert!(line.starts_with(&format!("{} ", idx)), "{}", line);
    }
    assert_eq!(
        lines[1000],
        "1000 libc.dylib                          0x00000000000013e8 0x1000 + 1000"
    );
}

#[test]
fn test_symbol_after_pc_falls_back_to_module_offset() {
    use crate::extract::Extractor;

    let dump: RawDump = r#"{
        "signal": {"name": "SIGSEGV", "code": "0", "address": 0},
        "threads": [{"index": 0, "frames": [
            {"pc": 4128, "symbol": {"name": "bogus", "start_address": 4200}}
        ]}],
        "images": [{"base_address": 4096, "size": 4096, "path": "/usr/lib/libc.dylib"}]
    }"#
    .parse()
    .unwrap();

    let thread = Extractor::new(&dump).extract_thread(&dump.threads[0]);
    assert_eq!(
        format_stack(&thread, &dump),
        "0   libc.dylib                          0x0000000000001020 0x1000 + 32"
    );
}
