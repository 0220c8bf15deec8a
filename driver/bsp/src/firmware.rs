//! 固件镜像容器
//!
//! 量产镜像可以是裸二进制，也可以是多版本容器：头部 `WCNM` 魔数 + 版本
//! 号 + 子镜像数，随后每个子镜像一条 12 字节目录项（版型 tag、偏移、
//! 长度）。下载前按芯片 ID 选出匹配版型的子镜像。
//!
//! 全部字段小端。这里只做解析，不碰总线。

use crate::error::{WcnError, WcnResult};

/// 容器魔数。
pub const IMG_HEAD_MAGIC: [u8; 4] = *b"WCNM";
/// AA 版型子镜像 tag。
pub const IMG_TAG_AA: [u8; 4] = *b"MLAA";
/// AB 版型子镜像 tag。
pub const IMG_TAG_AB: [u8; 4] = *b"MLAB";

/// 头部：魔数 + 版本 + 子镜像数。
const HEAD_LEN: usize = 12;
/// 目录项：tag + 偏移 + 长度。
const ENTRY_LEN: usize = 12;
/// 目录项数上限，防坏头部把解析拖进深渊。
const MAX_ENTRIES: u32 = 16;

/// 容器目录项。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageEntry {
    pub tag: [u8; 4],
    pub offset: u32,
    pub size: u32,
}

fn read_u32(blob: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&blob[off..off + 4]);
    u32::from_le_bytes(b)
}

/// 是否为容器镜像（否则按裸二进制整体下载）。
pub fn is_container(blob: &[u8]) -> bool {
    blob.len() >= HEAD_LEN && blob[..4] == IMG_HEAD_MAGIC
}

/// 由芯片 ID 决定要取的版型 tag：高 16 位与 AA 版 ID 相同取 `MLAA`，
/// 其余一律按后继版型 `MLAB` 处理。
pub fn revision_tag(chipid_aa: u32, chip_id: u32) -> [u8; 4] {
    if chip_id & 0xffff_0000 == chipid_aa & 0xffff_0000 {
        IMG_TAG_AA
    } else {
        IMG_TAG_AB
    }
}

/// 解析容器目录。
pub fn entries(blob: &[u8]) -> WcnResult<Vec<ImageEntry>> {
    if !is_container(blob) {
        return Err(WcnError::FirmwareFormat("not a container image"));
    }
    let count = read_u32(blob, 8);
    if count == 0 || count > MAX_ENTRIES {
        return Err(WcnError::FirmwareFormat("bad sub-image count"));
    }
    let table_end = HEAD_LEN + count as usize * ENTRY_LEN;
    if blob.len() < table_end {
        return Err(WcnError::FirmwareFormat("entry table truncated"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let off = HEAD_LEN + i * ENTRY_LEN;
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&blob[off..off + 4]);
        out.push(ImageEntry {
            tag,
            offset: read_u32(blob, off + 4),
            size: read_u32(blob, off + 8),
        });
    }
    Ok(out)
}

/// 从容器中取出匹配 `tag` 的子镜像切片。
pub fn select_image<'a>(blob: &'a [u8], tag: [u8; 4]) -> WcnResult<&'a [u8]> {
    for entry in entries(blob)? {
        if entry.tag != tag {
            continue;
        }
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        if entry.size == 0 || end > blob.len() {
            return Err(WcnError::FirmwareFormat("sub-image out of bounds"));
        }
        log::debug!(
            target: "wcn::bsp::fw",
            "container pick {}{}{}{} at 0x{:x} len {}",
            tag[0] as char, tag[1] as char, tag[2] as char, tag[3] as char,
            entry.offset, entry.size
        );
        return Ok(&blob[start..end]);
    }
    Err(WcnError::FirmwareFormat("no image for chip revision"))
}
