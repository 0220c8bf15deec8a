//! 固件下载与启动
//!
//! 镜像来源有两级：内存登记表（上层直接塞字节流）优先，其次按配置目录
//! 扫描分区/文件。首个扫到的目录记下来，后续加载免扫描。分区节点在系统
//! 启动早期可能还没建好，打开失败按固定间隔重试若干轮。
//!
//! 下载本身是朴素的分包直写：按芯片档案的包长切片顺序写入装载窗，任何
//! 一包失败立即中止整次下载。写完释放镜像缓冲，再清复位位放核开跑。

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use bus::{BusRegister, SharedBus};

use crate::chip::ChipProfile;
use crate::error::{WcnError, WcnResult};
use crate::export::{CpCore, WcnConfig};
use crate::firmware;
use crate::sync::{delay_ms, CancelToken};

/// 镜像打开的重试轮数。
const FW_OPEN_RETRY_MAX: u32 = 15;

/// 选好版型、盖好功能掩码、可直接下载的一份镜像。
pub struct FirmwareImage {
    core: CpCore,
    data: Vec<u8>,
}

impl core::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FirmwareImage({}, {} bytes)", self.core.name(), self.data.len())
    }
}

impl FirmwareImage {
    pub fn core(&self) -> CpCore {
        self.core
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 固件装载器。无内部流程状态，可被下载工码线程并发持有。
pub struct FirmwareLoader {
    bus: SharedBus,
    profile: &'static ChipProfile,
    store: spin::Mutex<Vec<(String, Arc<[u8]>)>>,
    /// 首次扫描命中的目录，此后直接走它。
    cached_dir: spin::Mutex<Option<PathBuf>>,
    search_paths: Vec<PathBuf>,
    btwf_name: String,
    gnss_name: String,
    function_mask: [u8; 8],
    retry_delay_ms: u64,
    cancel: CancelToken,
}

impl FirmwareLoader {
    pub fn new(
        bus: SharedBus,
        profile: &'static ChipProfile,
        cfg: &WcnConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            bus,
            profile,
            store: spin::Mutex::new(Vec::new()),
            cached_dir: spin::Mutex::new(None),
            search_paths: cfg.firmware_search_paths.clone(),
            btwf_name: cfg.btwf_firmware.clone(),
            gnss_name: cfg.gnss_firmware.clone(),
            function_mask: cfg.btwf_function_mask,
            retry_delay_ms: cfg.fw_open_retry_delay_ms,
            cancel,
        }
    }

    /// 向登记表塞一份镜像，同名覆盖。
    pub fn register_firmware(&self, name: &str, data: &[u8]) {
        let mut store = self.store.lock();
        if let Some(slot) = store.iter_mut().find(|(n, _)| n == name) {
            slot.1 = Arc::from(data);
        } else {
            store.push((name.to_string(), Arc::from(data)));
        }
        log::debug!(target: "wcn::bsp::fw", "firmware {} registered, {} bytes", name, data.len());
    }

    fn store_lookup(&self, name: &str) -> Option<Arc<[u8]>> {
        self.store
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    }

    /// 从分区/文件系统读镜像，最多读 `limit` 字节。
    fn read_partition(&self, name: &str, limit: usize) -> WcnResult<Vec<u8>> {
        for attempt in 1..=FW_OPEN_RETRY_MAX {
            if self.cancel.is_cancelled() {
                return Err(WcnError::Cancelled);
            }
            let cached = self.cached_dir.lock().clone();
            let dirs = cached.iter().chain(self.search_paths.iter());
            for dir in dirs {
                let path = dir.join(name);
                let mut file = match File::open(&path) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                let mut buf = Vec::new();
                buf.try_reserve_exact(limit)
                    .map_err(|_| WcnError::ResourceAlloc)?;
                if let Err(e) = file.take(limit as u64).read_to_end(&mut buf) {
                    log::error!(target: "wcn::bsp::fw", "read {} failed: {}", path.display(), e);
                    return Err(WcnError::FirmwareMissing);
                }
                log::info!(
                    target: "wcn::bsp::fw",
                    "firmware {} loaded from {}, {} bytes",
                    name,
                    dir.display(),
                    buf.len()
                );
                *self.cached_dir.lock() = Some(dir.clone());
                return Ok(buf);
            }
            if attempt < FW_OPEN_RETRY_MAX {
                log::info!(
                    target: "wcn::bsp::fw",
                    "firmware {} not ready (attempt {}/{}), retry in {}ms",
                    name,
                    attempt,
                    FW_OPEN_RETRY_MAX,
                    self.retry_delay_ms
                );
                delay_ms(self.retry_delay_ms);
            }
        }
        log::error!(target: "wcn::bsp::fw", "firmware {} not found anywhere", name);
        Err(WcnError::FirmwareMissing)
    }

    /// 取出并准备一个核的镜像：登记表/分区 → 容器选片 → 功能掩码。
    pub fn load(&self, core: CpCore) -> WcnResult<FirmwareImage> {
        let (name, limit) = match core {
            CpCore::Btwf => (&self.btwf_name, self.profile.firmware_max_size as usize),
            CpCore::Gnss => (&self.gnss_name, self.profile.gnss_firmware_max_size as usize),
        };
        let mut data = match self.store_lookup(name) {
            Some(blob) => {
                let mut v = Vec::new();
                v.try_reserve_exact(blob.len())
                    .map_err(|_| WcnError::ResourceAlloc)?;
                v.extend_from_slice(&blob);
                v
            }
            None => self.read_partition(name, limit)?,
        };

        if firmware::is_container(&data) {
            let chip_id = self
                .bus
                .reg_read(self.profile.chipid_reg)
                .map_err(WcnError::from_errno)?;
            let tag = firmware::revision_tag(self.profile.chipid_aa, chip_id);
            log::info!(
                target: "wcn::bsp::fw",
                "chip id 0x{:08x}, container image {}",
                chip_id,
                name
            );
            let selected = firmware::select_image(&data, tag)?;
            let mut v = Vec::new();
            v.try_reserve_exact(selected.len())
                .map_err(|_| WcnError::ResourceAlloc)?;
            v.extend_from_slice(selected);
            data = v;
        }
        if data.len() > limit {
            return Err(WcnError::FirmwareFormat("image larger than load window"));
        }

        if core == CpCore::Btwf {
            if data.len() < self.function_mask.len() {
                return Err(WcnError::FirmwareFormat("image too small"));
            }
            // 前 8 字节是功能掩码槽位，按配置覆写后随镜像一起下去
            data[..self.function_mask.len()].copy_from_slice(&self.function_mask);
        }
        Ok(FirmwareImage { core, data })
    }

    /// 分包下载镜像到对应装载窗。任何一包失败立即中止。
    pub fn transfer(&self, image: &FirmwareImage) -> WcnResult<()> {
        let base = self.profile.load_base(image.core());
        let packet = self.profile.packet_size;
        let total = (image.len() + packet - 1) / packet;
        log::info!(
            target: "wcn::bsp::fw",
            "{} download start, addr=0x{:08x} len={} ({} packets)",
            image.core().name(),
            base,
            image.len(),
            total
        );
        let mut last_pct = 0;
        for (i, chunk) in image.data().chunks(packet).enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!(target: "wcn::bsp::fw", "{} download cancelled", image.core().name());
                return Err(WcnError::Cancelled);
            }
            let addr = base + (i * packet) as u32;
            if let Err(errno) = self.bus.direct_write(addr, chunk) {
                log::error!(
                    target: "wcn::bsp::fw",
                    "{} download failed at packet {}/{} (errno {})",
                    image.core().name(),
                    i + 1,
                    total,
                    errno
                );
                return Err(WcnError::from_errno(errno));
            }
            let pct = (i + 1) * 100 / total;
            if pct / 25 > last_pct / 25 && pct < 100 {
                log::info!(
                    target: "wcn::bsp::fw",
                    "{} download progress {}/{} ({}%)",
                    image.core().name(),
                    i + 1,
                    total,
                    pct
                );
            }
            last_pct = pct;
        }
        log::info!(target: "wcn::bsp::fw", "{} download done", image.core().name());
        Ok(())
    }

    /// 清复位位，放核开跑。
    pub fn start_core(&self, core: CpCore) -> WcnResult<()> {
        let (reg, bits) = self.profile.reset_reg(core);
        BusRegister::new(self.bus.clone(), reg)
            .clear_bits(bits)
            .map_err(WcnError::from_errno)?;
        log::info!(target: "wcn::bsp::fw", "{} reset released", core.name());
        Ok(())
    }

    /// 一个核的完整装载：取镜像、下载、放复位。镜像缓冲下载完即释放。
    pub fn boot_core(&self, core: CpCore) -> WcnResult<()> {
        let image = self.load(core)?;
        self.transfer(&image)?;
        drop(image);
        self.start_core(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{profile_for, ChipFamily};
    use crate::firmware::{IMG_TAG_AA, IMG_TAG_AB};
    use crate::testutil::{fw_container, test_config};
    use bus::{BusOp, MemBus};

    fn loader_on(bus: &Arc<MemBus>) -> FirmwareLoader {
        let shared: SharedBus = bus.clone();
        FirmwareLoader::new(
            shared,
            profile_for(ChipFamily::Marlin3),
            &test_config(),
            CancelToken::new(),
        )
    }

    #[test]
    fn function_mask_lands_in_btwf_head_only() {
        let bus: SharedBus = Arc::new(MemBus::new());
        let mut cfg = test_config();
        cfg.btwf_function_mask = [1, 2, 3, 4, 5, 6, 7, 8];
        let loader = FirmwareLoader::new(
            bus,
            profile_for(ChipFamily::Marlin3),
            &cfg,
            CancelToken::new(),
        );

        loader.register_firmware("wcnmodem", &[0u8; 16]);
        loader.register_firmware("gnssmodem", &[9u8; 16]);

        let btwf = loader.load(CpCore::Btwf).unwrap();
        assert_eq!(&btwf.data()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&btwf.data()[8..], &[0u8; 8]);

        let gnss = loader.load(CpCore::Gnss).unwrap();
        assert_eq!(gnss.data(), &[9u8; 16]);
    }

    #[test]
    fn container_is_resolved_by_chip_id() {
        let bus = Arc::new(MemBus::new());
        let profile = profile_for(ChipFamily::Marlin3);
        bus.preset_reg(profile.chipid_reg, profile.chipid_aa | 0xa1);
        let loader = loader_on(&bus);

        let aa = vec![0x11u8; 32];
        let ab = vec![0x22u8; 32];
        loader.register_firmware("gnssmodem", &fw_container(&[(IMG_TAG_AA, &aa), (IMG_TAG_AB, &ab)]));

        let img = loader.load(CpCore::Gnss).unwrap();
        assert_eq!(img.data(), &aa[..]);
        assert!(bus
            .journal()
            .contains(&BusOp::RegRead(profile.chipid_reg)));
    }

    #[test]
    fn transfer_chunks_by_packet_and_reads_back() {
        let bus = Arc::new(MemBus::new());
        let loader = loader_on(&bus);
        let profile = profile_for(ChipFamily::Marlin3);

        let data: Vec<u8> = (0..80 * 1024).map(|i| (i % 251) as u8).collect();
        loader.register_firmware("gnssmodem", &data);
        let img = loader.load(CpCore::Gnss).unwrap();
        loader.transfer(&img).unwrap();

        let ps = profile.packet_size;
        let base = profile.gnss_cp_start_addr;
        let writes: Vec<_> = bus
            .journal()
            .into_iter()
            .filter(|op| matches!(op, BusOp::DirectWrite { .. }))
            .collect();
        assert_eq!(
            writes,
            vec![
                BusOp::DirectWrite { addr: base, len: ps },
                BusOp::DirectWrite { addr: base + ps as u32, len: ps },
                BusOp::DirectWrite { addr: base + 2 * ps as u32, len: 16 * 1024 },
            ]
        );
        assert_eq!(bus.peek_ram(base, data.len()), data);
    }

    #[test]
    fn transfer_aborts_on_first_write_error() {
        let bus = Arc::new(MemBus::new());
        bus.fail_direct_write_after(1);
        let loader = loader_on(&bus);

        let data = vec![7u8; 80 * 1024];
        loader.register_firmware("wcnmodem", &data);
        let img = loader.load(CpCore::Btwf).unwrap();
        assert_eq!(loader.transfer(&img), Err(WcnError::BusIo { errno: bus::EIO }));

        let writes = bus
            .journal()
            .iter()
            .filter(|op| matches!(op, BusOp::DirectWrite { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn cancelled_transfer_writes_nothing() {
        let bus = Arc::new(MemBus::new());
        let shared: SharedBus = bus.clone();
        let cancel = CancelToken::new();
        let loader = FirmwareLoader::new(
            shared,
            profile_for(ChipFamily::Marlin3),
            &test_config(),
            cancel.clone(),
        );
        loader.register_firmware("gnssmodem", &[1u8; 1024]);
        let img = loader.load(CpCore::Gnss).unwrap();

        cancel.cancel();
        assert_eq!(loader.transfer(&img), Err(WcnError::Cancelled));
        assert!(bus.journal().is_empty());
    }

    #[test]
    fn partition_scan_finds_file_and_caches_dir() {
        let dir = std::env::temp_dir().join(format!("wcn-fwload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("gnssmodem"), [3u8; 128]).unwrap();

        let bus: SharedBus = Arc::new(MemBus::new());
        let mut cfg = test_config();
        cfg.firmware_search_paths = vec![dir.clone()];
        let loader = FirmwareLoader::new(
            bus,
            profile_for(ChipFamily::Marlin3),
            &cfg,
            CancelToken::new(),
        );

        let img = loader.load(CpCore::Gnss).unwrap();
        assert_eq!(img.data(), &[3u8; 128]);
        assert_eq!(*loader.cached_dir.lock(), Some(dir.clone()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn absent_firmware_exhausts_retries() {
        let bus: SharedBus = Arc::new(MemBus::new());
        let mut cfg = test_config();
        cfg.firmware_search_paths =
            vec![std::env::temp_dir().join("wcn-no-such-dir-ever")];
        cfg.fw_open_retry_delay_ms = 0;
        let loader = FirmwareLoader::new(
            bus,
            profile_for(ChipFamily::Marlin3),
            &cfg,
            CancelToken::new(),
        );
        assert_eq!(
            loader.load(CpCore::Btwf).unwrap_err(),
            WcnError::FirmwareMissing
        );
    }

    #[test]
    fn oversized_image_is_rejected() {
        let bus = Arc::new(MemBus::new());
        let loader = loader_on(&bus);
        let profile = profile_for(ChipFamily::Marlin3);
        let big = vec![0u8; profile.gnss_firmware_max_size as usize + 1];
        loader.register_firmware("gnssmodem", &big);
        assert_eq!(
            loader.load(CpCore::Gnss).unwrap_err(),
            WcnError::FirmwareFormat("image larger than load window")
        );
    }
}
