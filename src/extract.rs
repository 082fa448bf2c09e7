use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::image::{resolve, Addr, Image};
use crate::raw::{RawDump, RawFrame, RawThread};

/// Upper bound on the frames kept per stack.
pub const DEFAULT_MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub start_address: Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub instruction_address: Addr,
    /// Identity of the owning image in the module table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub value: Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub index: u32,
    pub frames: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registers: Vec<Register>,
    pub is_crashed: bool,
}

/// The images referenced by a report, deduplicated by identity.
///
/// Serializes as a flat list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Image>", into = "Vec<Image>")]
pub struct ModuleTable {
    images: Vec<Image>,
    seen: HashSet<String>,
}

impl ModuleTable {
    pub fn new() -> ModuleTable {
        ModuleTable::default()
    }

    /// Adds an image unless one with the same identity is already present.
    ///
    /// Returns `true` if the image was inserted.
    pub fn insert(&mut self, image: Image) -> bool {
        if self.seen.insert(image.identity()) {
            self.images.push(image);
            true
        } else {
            false
        }
    }

    pub fn get(&self, identity: &str) -> Option<&Image> {
        if !self.seen.contains(identity) {
            return None;
        }
        self.images.iter().find(|image| image.identity() == identity)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }
}

impl From<Vec<Image>> for ModuleTable {
    fn from(images: Vec<Image>) -> ModuleTable {
        let mut rv = ModuleTable::new();
        for image in images {
            rv.insert(image);
        }
        rv
    }
}

impl From<ModuleTable> for Vec<Image> {
    fn from(table: ModuleTable) -> Vec<Image> {
        table.images
    }
}

/// Turns raw frames and threads of one dump into normalized records while
/// collecting every image they reference.
pub struct Extractor<'a> {
    dump: &'a RawDump,
    modules: ModuleTable,
    max_frames: usize,
}

impl<'a> Extractor<'a> {
    pub fn new(dump: &'a RawDump) -> Extractor<'a> {
        Extractor::with_max_frames(dump, DEFAULT_MAX_FRAMES)
    }

    pub fn with_max_frames(dump: &'a RawDump, max_frames: usize) -> Extractor<'a> {
        Extractor {
            dump,
            modules: ModuleTable::new(),
            max_frames,
        }
    }

    /// Normalizes a single frame. Frames outside of every known image keep
    /// their address and carry no image reference.
    pub fn extract_frame(&mut self, raw: &RawFrame) -> Frame {
        let image = resolve(raw.pc, self.dump).map(|image| {
            let identity = image.identity();
            self.modules.insert(image);
            identity
        });
        Frame {
            instruction_address: Addr(raw.pc),
            image,
            symbol: raw.symbol.as_ref().map(|sym| Symbol {
                name: sym.name.clone(),
                start_address: Addr(sym.start_address),
            }),
        }
    }

    /// Normalizes a stack in capture order, capped at the frame limit.
    pub fn extract_frames(&mut self, frames: &[RawFrame]) -> Vec<Frame> {
        if frames.len() > self.max_frames {
            warn!(
                frames = frames.len(),
                limit = self.max_frames,
                "truncating oversized stack"
            );
        }
        frames
            .iter()
            .take(self.max_frames)
            .map(|frame| self.extract_frame(frame))
            .collect()
    }

    pub fn extract_thread(&mut self, raw: &RawThread) -> ThreadRecord {
        ThreadRecord {
            index: raw.index,
            frames: self.extract_frames(&raw.frames),
            registers: raw
                .registers
                .iter()
                .filter_map(|reg| {
                    Some(Register {
                        name: reg.name.clone().filter(|name| !name.is_empty())?,
                        value: Addr(reg.value),
                    })
                })
                .collect(),
            is_crashed: raw.crashed,
        }
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    pub fn into_modules(self) -> ModuleTable {
        self.modules
    }
}

#[cfg(test)]
fn test_dump() -> RawDump {
    r#"{
        "signal": {"name": "SIGSEGV", "code": "SEGV_MAPERR", "address": 57005},
        "threads": [
            {
                "index": 0,
                "crashed": true,
                "frames": [
                    {"pc": 4100, "symbol": {"name": "main", "start_address": 4096}},
                    {"pc": 4200},
                    {"pc": 8300},
                    {"pc": 1}
                ],
                "registers": [
                    {"name": "pc", "value": 4100},
                    {"value": 12},
                    {"name": "", "value": 13},
                    {"name": "sp", "value": 65536}
                ]
            },
            {"index": 1, "frames": [{"pc": 8200}, {"pc": 4300}]}
        ],
        "images": [
            {"base_address": 4096, "size": 4096, "path": "/private/var/containers/Bundle/Application/X/Demo.app/Demo"},
            {"base_address": 8192, "size": 4096, "path": "/usr/lib/system/libsystem_c.dylib"}
        ]
    }"#
    .parse()
    .unwrap()
}

#[test]
fn test_extract_thread() {
    let dump = test_dump();
    let mut extractor = Extractor::new(&dump);
    let thread = extractor.extract_thread(&dump.threads[0]);

    assert!(thread.is_crashed);
    assert_eq!(thread.frames.len(), 4);
    assert_eq!(
        thread.frames[0].image.as_deref(),
        Some("/private/var/containers/Bundle/Application/X/Demo.app/Demo")
    );
    assert_eq!(thread.frames[0].symbol.as_ref().unwrap().name, "main");
    assert_eq!(
        thread.frames[2].image.as_deref(),
        Some("/usr/lib/system/libsystem_c.dylib")
    );
    assert_eq!(thread.frames[3].instruction_address, Addr(1));
    assert!(thread.frames[3].image.is_none());
    assert!(thread.frames[3].symbol.is_none());

    let names: Vec<_> = thread.registers.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["pc", "sp"]);
    assert_eq!(extractor.modules().len(), 2);
}

#[test]
fn test_modules_are_deduplicated() {
    let dump = test_dump();
    let mut extractor = Extractor::new(&dump);
    for thread in &dump.threads {
        extractor.extract_thread(thread);
    }
    let modules = extractor.into_modules();
    assert_eq!(modules.len(), 2);
    assert!(modules.get("/usr/lib/system/libsystem_c.dylib").is_some());
    assert!(modules.get("/usr/lib/libobjc.dylib").is_none());
    assert!(modules
        .iter()
        .any(|image| image.is_user_code && image.name == "Demo"));
}

#[test]
fn test_frame_limit() {
    let dump = test_dump();
    let mut extractor = Extractor::with_max_frames(&dump, 2);
    let thread = extractor.extract_thread(&dump.threads[0]);
    assert_eq!(thread.frames.len(), 2);
    assert_eq!(extractor.modules().len(), 1);
}

#[test]
fn test_module_table_serializes_as_list() {
    let dump = test_dump();
    let mut extractor = Extractor::new(&dump);
    extractor.extract_thread(&dump.threads[1]);
    let modules = extractor.into_modules();
    let json = serde_json::to_value(&modules).unwrap();
    assert_eq!(json.as_array().map(Vec::len), Some(2));
    assert_eq!(json[0]["path"], "/usr/lib/system/libsystem_c.dylib");
    assert_eq!(json[0]["base_address"], "0x2000");

    let parsed: ModuleTable = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, modules);
}
