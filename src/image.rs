use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::raw::{RawDump, RawImage, RawProcessor};

lazy_static! {
    static ref APP_CONTAINER_RE: Regex = Regex::new(
        r#"(?xi)
        /containers/(?:Bundle|Data)/Application/
    "#
    )
    .unwrap();
    static ref SYSTEM_PATH_RE: Regex = Regex::new(
        r#"(?x)
        ^(?:/System/|/usr/|/Library/Apple/|/private/preboot/)
        |
        /RuntimeRoot/
    "#
    )
    .unwrap();
    static ref APP_BUNDLE_RE: Regex = Regex::new(
        r#"(?x)
        \.app/
    "#
    )
    .unwrap();
}

pub const CPU_ARCH_ABI64: u64 = 0x0100_0000;
pub const CPU_ARCH_ABI64_32: u64 = 0x0200_0000;
pub const CPU_SUBTYPE_MASK: u64 = 0xff00_0000;

pub const CPU_TYPE_X86: u64 = 7;
pub const CPU_TYPE_X86_64: u64 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM: u64 = 12;
pub const CPU_TYPE_ARM64: u64 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64_32: u64 = CPU_TYPE_ARM | CPU_ARCH_ABI64_32;

const UNKNOWN_ARCH: &str = "???";

/// An absolute address, serialized as lower-case hex.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(pub u64);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Addr, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| D::Error::custom(format!("address {:?} lacks 0x prefix", s)))?;
        u64::from_str_radix(digits, 16)
            .map(Addr)
            .map_err(D::Error::custom)
    }
}

/// A binary image mapped into the crashed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub base_address: Addr,
    pub size: u64,
    pub path: String,
    pub name: String,
    pub build_id: String,
    pub architecture: String,
    pub is_user_code: bool,
}

impl Image {
    pub fn from_raw(raw: &RawImage) -> Image {
        let path = raw.path.clone().unwrap_or_default();
        Image {
            base_address: Addr(raw.base_address),
            size: raw.size,
            name: basename(&path).unwrap_or("???").to_string(),
            build_id: raw.uuid.as_deref().map(format_build_id).unwrap_or_default(),
            architecture: raw
                .code_type
                .map(|p| architecture_name(p.cpu_type, p.cpu_subtype))
                .unwrap_or_else(|| UNKNOWN_ARCH.to_string()),
            is_user_code: is_user_code(&path),
            path,
        }
    }

    /// The key images are deduplicated by: the path, or the base address
    /// for images without one.
    pub fn identity(&self) -> String {
        if self.path.is_empty() {
            self.base_address.to_string()
        } else {
            self.path.clone()
        }
    }
}

/// Finds the image whose address range contains `address`.
pub fn resolve(address: u64, dump: &RawDump) -> Option<Image> {
    dump.images
        .iter()
        .find(|image| image.contains(address))
        .map(Image::from_raw)
}

/// Renders raw build id bytes in the canonical upper-case form.
///
/// 16 byte identifiers become `8-4-4-4-12` grouped UUID strings, anything
/// else is emitted as contiguous hex.
pub fn format_build_id(bytes: &[u8]) -> String {
    match Uuid::from_slice(bytes) {
        Ok(uuid) => uuid
            .hyphenated()
            .encode_upper(&mut Uuid::encode_buffer())
            .to_string(),
        Err(_) => bytes.iter().map(|b| format!("{:02X}", b)).collect(),
    }
}

/// Maps a Mach-O cpu type and subtype to the short architecture name.
pub fn architecture_name(cpu_type: u64, cpu_subtype: u64) -> String {
    let subtype = cpu_subtype & !CPU_SUBTYPE_MASK;
    let (family, name) = match cpu_type {
        CPU_TYPE_ARM => (
            "arm",
            match subtype {
                6 => Some("armv6"),
                9 => Some("armv7"),
                10 => Some("armv7f"),
                11 => Some("armv7s"),
                12 => Some("armv7k"),
                13 => Some("armv8"),
                _ => None,
            },
        ),
        CPU_TYPE_ARM64 => (
            "arm64",
            match subtype {
                0 | 1 => Some("arm64"),
                2 => Some("arm64e"),
                _ => None,
            },
        ),
        CPU_TYPE_ARM64_32 => (
            "arm64_32",
            match subtype {
                0 | 1 => Some("arm64_32"),
                _ => None,
            },
        ),
        CPU_TYPE_X86 => (
            "i386",
            match subtype {
                3 => Some("i386"),
                _ => None,
            },
        ),
        CPU_TYPE_X86_64 => (
            "x86_64",
            match subtype {
                3 => Some("x86_64"),
                8 => Some("x86_64h"),
                _ => None,
            },
        ),
        _ => return UNKNOWN_ARCH.to_string(),
    };
    match name {
        Some(name) => name.to_string(),
        None => format!("{}-unknown", family),
    }
}

/// Whether the processor uses 64 bit pointers.
pub fn is_64_bit(processor: RawProcessor) -> bool {
    processor.cpu_type & (CPU_ARCH_ABI64 | CPU_ARCH_ABI64_32) != 0
}

/// Coarse guess whether an image ships with the application rather than
/// the operating system.
pub fn is_user_code(path: &str) -> bool {
    if APP_CONTAINER_RE.is_match(path) {
        true
    } else if SYSTEM_PATH_RE.is_match(path) {
        false
    } else {
        APP_BUNDLE_RE.is_match(path)
    }
}

pub(crate) fn basename(path: &str) -> Option<&str> {
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

#[test]
fn test_build_id_canonical_form() {
    let bytes = [
        0x2d, 0x90, 0x32, 0x91, 0x39, 0x7d, 0x3d, 0x14, 0xbf, 0xca, 0x52, 0xc7, 0xfb, 0x8c, 0x5e,
        0x00,
    ];
    assert_eq!(
        format_build_id(&bytes),
        "2D903291-397D-3D14-BFCA-52C7FB8C5E00"
    );

    for seed in 0u8..=255 {
        let bytes: Vec<u8> = (0..16u8).map(|i| seed.wrapping_mul(31).wrapping_add(i * 17)).collect();
        let id = format_build_id(&bytes);
        assert_eq!(id.len(), 36);
        for (idx, c) in id.char_indices() {
            if [8, 13, 18, 23].contains(&idx) {
                assert_eq!(c, '-');
            } else {
                assert!(c.is_ascii_digit() || ('A'..='F').contains(&c), "{}", id);
            }
        }
    }

    assert_eq!(format_build_id(&[0xde, 0xad, 0xbe, 0xef]), "DEADBEEF");
}

#[test]
fn test_architecture_names() {
    assert_eq!(architecture_name(CPU_TYPE_ARM64, 0), "arm64");
    assert_eq!(architecture_name(CPU_TYPE_ARM64, 1), "arm64");
    assert_eq!(architecture_name(CPU_TYPE_ARM64, 2), "arm64e");
    assert_eq!(architecture_name(CPU_TYPE_ARM64, 0x8000_0002), "arm64e");
    assert_eq!(architecture_name(CPU_TYPE_ARM64, 77), "arm64-unknown");
    assert_eq!(architecture_name(CPU_TYPE_ARM, 6), "armv6");
    assert_eq!(architecture_name(CPU_TYPE_ARM, 9), "armv7");
    assert_eq!(architecture_name(CPU_TYPE_ARM, 11), "armv7s");
    assert_eq!(architecture_name(CPU_TYPE_ARM, 99), "arm-unknown");
    assert_eq!(architecture_name(CPU_TYPE_X86_64, 3), "x86_64");
    assert_eq!(architecture_name(CPU_TYPE_X86_64, 8), "x86_64h");
    assert_eq!(architecture_name(CPU_TYPE_X86, 3), "i386");
    assert_eq!(architecture_name(18, 0), "???");
}

#[test]
fn test_user_code_heuristic() {
    assert!(is_user_code(
        "/private/var/containers/Bundle/Application/0C5B5A8C-2A4F-4B0B-9C55-8E8E6D4B6E4A/Demo.app/Demo"
    ));
    assert!(is_user_code(
        "/Users/dev/Library/Developer/CoreSimulator/Devices/D1/data/Containers/Bundle/Application/A1/Demo.app/Frameworks/Kit.framework/Kit"
    ));
    assert!(is_user_code("/Applications/Demo.app/Contents/MacOS/Demo"));
    assert!(!is_user_code("/usr/lib/system/libsystem_kernel.dylib"));
    assert!(!is_user_code(
        "/System/Library/Frameworks/UIKit.framework/UIKit"
    ));
    assert!(!is_user_code(""));
}

#[test]
fn test_addr_serialization() {
    assert_eq!(serde_json::to_string(&Addr(0xdead)).unwrap(), "\"0xdead\"");
    let addr: Addr = serde_json::from_str("\"0x7fff61bc6c2a\"").unwrap();
    assert_eq!(addr, Addr(0x7fff61bc6c2a));
    assert!(serde_json::from_str::<Addr>("\"1234\"").is_err());
}
