//! Bare-metal entry
//!
//! Translates the loader's handoff into the kernel's boot structures
//! and enters `boot::kernel_main`. On hosted targets the binary is a
//! stub; the kernel proper is exercised as a library there.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::{entry_point, BootInfo as LoaderInfo};
    use quark_kernel::bootinfo::{BootInfo, MemoryKind, MemoryRange};

    pub static BOOT_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::FixedAddress(
            quark_kernel::mm::PHYS_MAP_BASE,
        ));
        config
    };

    entry_point!(kernel_entry, config = &BOOT_CONFIG);

    fn kernel_entry(loader: &'static mut LoaderInfo) -> ! {
        let mut info = BootInfo::new();

        for region in loader.memory_regions.iter() {
            let kind = match region.kind {
                bootloader_api::info::MemoryRegionKind::Usable => MemoryKind::Free,
                bootloader_api::info::MemoryRegionKind::Bootloader => MemoryKind::Reclaimable,
                _ => MemoryKind::Allocated,
            };
            let _ = info.memory.push(MemoryRange {
                base: region.start,
                size: region.end - region.start,
                kind,
            });
        }

        if let bootloader_api::info::Optional::Some(ref fb) = loader.framebuffer {
            let buf = fb.info();
            info.framebuffer = Some(quark_kernel::bootinfo::FramebufferInfo {
                base: fb.buffer().as_ptr() as u64,
                width: buf.width as u32,
                height: buf.height as u32,
                pitch: buf.stride as u32 * (buf.bytes_per_pixel as u32),
                bpp: (buf.bytes_per_pixel * 8) as u8,
            });
        }

        if let bootloader_api::info::Optional::Some(rsdp) = loader.rsdp_addr {
            info.firmware = quark_kernel::bootinfo::FirmwareTables::AcpiRsdp(rsdp);
        }

        quark_kernel::boot::kernel_main(&info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("quark-kernel: hosted build; run the test suite instead");
}
