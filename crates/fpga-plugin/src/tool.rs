//! One-shot operator commands.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use error_stack::Report;
use fpga::bitstream;
use fpga::bitstream::Bitstream;
use fpga::device;
use fpga::device::Fme;
use fpga::device::Port;
use fpga::devicecache::Cache;
use fpga::reconfig;
use tokio::sync::mpsc;

use crate::config::BitstreamArgs;
use crate::config::DeviceArgs;
use crate::config::InstallArgs;
use crate::config::ListArgs;
use crate::config::PrArgs;

fn to_anyhow<C>(report: Report<C>) -> anyhow::Error {
    anyhow::anyhow!("{report:?}")
}

pub fn info(args: BitstreamArgs) -> Result<()> {
    let bitstream = bitstream::open(&args.bitstream).map_err(to_anyhow)?;
    print!(
        "{}",
        describe_bitstream(bitstream.as_ref(), &args.bitstream, &args.bitstream_dir)
    );
    Ok(())
}

pub fn install(args: InstallArgs) -> Result<()> {
    let source = &args.bitstream.bitstream;
    let bitstream = bitstream::open(source).map_err(to_anyhow)?;
    let destination = bitstream::install(
        bitstream.as_ref(),
        source,
        &args.bitstream.bitstream_dir,
        args.dry_run,
    )
    .map_err(to_anyhow)?;

    println!("Installing bitstream {} as {}", source.display(), destination.display());
    if args.dry_run {
        println!("Dry-run: no copying performed");
    }
    Ok(())
}

pub fn pr(args: PrArgs) -> Result<()> {
    if !device::is_port(&args.device) {
        anyhow::bail!("{} is not an FPGA port", args.device);
    }
    let port = device::open_port(&args.device).map_err(to_anyhow)?;

    let (outcome, afu) = match (&args.bitstream, &args.afu) {
        (Some(path), _) => {
            let bitstream = bitstream::open(path).map_err(to_anyhow)?;
            let outcome = port.pr(bitstream.as_ref(), args.dry_run).map_err(to_anyhow)?;
            (outcome, bitstream.accelerator_type_uuid())
        }
        (None, Some(afu)) => {
            let outcome = reconfig::program_afu(port.as_ref(), &args.bitstream_dir, afu, args.dry_run)
                .map_err(to_anyhow)?;
            (outcome, device::canonize_id(afu))
        }
        (None, None) => anyhow::bail!("either --bitstream or --afu is required"),
    };

    println!("{}: {outcome} ({afu})", args.device);
    Ok(())
}

pub fn fpgainfo(args: DeviceArgs) -> Result<()> {
    let Some(name) = args.device else {
        let (fmes, ports) = device::list_fpga_devices(&args.platform_dir).map_err(to_anyhow)?;
        print!("{}", describe_device_list(&fmes, &ports));
        return Ok(());
    };

    let text = if device::is_fme(&name) {
        let fme = device::open_fme(&name).map_err(to_anyhow)?;
        describe_fme(fme.as_ref())
    } else if device::is_port(&name) {
        let port = device::open_port(&name).map_err(to_anyhow)?;
        if args.reset {
            port.reset().map_err(to_anyhow)?;
        }
        describe_port(port.as_ref())
    } else {
        anyhow::bail!("unknown FPGA device {name}");
    };

    print!("{text}");
    Ok(())
}

fn describe_device_list(fmes: &[String], ports: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FMEs  : {}", fmes.join(" "));
    let _ = writeln!(out, "Ports : {}", ports.join(" "));
    out
}

pub fn list(args: ListArgs) -> Result<()> {
    let (layout, class_dir) = args.scan.resolve().map_err(to_anyhow)?;
    let (tx, _rx) = mpsc::channel(1);
    let mut cache = Cache::new(&class_dir, &args.scan.devfs_dir, &args.scan.mode, tx)
        .map_err(to_anyhow)?
        .with_layout(layout);
    cache.scan().map_err(to_anyhow)?;

    let classes = cache.mode().device_map(cache.devices()).map_err(to_anyhow)?;
    println!("{}", serde_json::to_string_pretty(&classes)?);
    Ok(())
}

/// Renders a field, falling back to the error's display text.
fn field<T: std::fmt::Display, C>(value: Result<T, Report<C>>) -> String {
    match value {
        Ok(v) => v.to_string(),
        Err(e) => format!("<{e}>"),
    }
}

pub fn describe_bitstream(bitstream: &dyn Bitstream, path: &Path, root: &Path) -> String {
    let install_path = bitstream
        .install_path(root)
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let mut out = String::new();
    let _ = writeln!(out, "Bitstream file        : {:?}", path.display().to_string());
    let _ = writeln!(out, "Interface UUID        : {:?}", bitstream.interface_uuid());
    let _ = writeln!(out, "Accelerator Type UUID : {:?}", bitstream.accelerator_type_uuid());
    let _ = writeln!(out, "Unique UUID           : {:?}", bitstream.unique_uuid());
    let _ = writeln!(out, "Installation Path     : {install_path:?}");

    let extra = bitstream.extra_metadata();
    if !extra.is_empty() {
        let _ = writeln!(out, "Extra:");
        for (key, value) in extra {
            let _ = writeln!(out, "\t{key} : {value:?}");
        }
    }
    out
}

fn describe_fme(fme: &dyn Fme) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Device             : {}", fme.dev_path().display());
    let _ = writeln!(out, "Name               : {}", field(fme.name()));
    let _ = writeln!(out, "API                : {}", field(fme.api_version()));
    let _ = writeln!(out, "CheckExtension     : {}", field(fme.check_extension()));
    let _ = writeln!(
        out,
        "PCI                : {}",
        field(fme.pci_device().map(|pci| pci.bdf.clone()))
    );
    let _ = writeln!(out, "Interface UUID     : {}", field(fme.interface_uuid()));
    let _ = writeln!(out, "Ports              : {}", field(fme.ports_num()));
    let _ = writeln!(out, "Socket ID          : {}", field(fme.socket_id()));
    let _ = writeln!(out, "Bitstream ID       : {}", field(fme.bitstream_id()));
    let _ = writeln!(out, "Bitstream Metadata : {}", field(fme.bitstream_metadata()));
    out
}

fn describe_port(port: &dyn Port) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Device             : {}", port.dev_path().display());
    let _ = writeln!(out, "Name               : {}", field(port.name()));
    let _ = writeln!(out, "API                : {}", field(port.api_version()));
    let _ = writeln!(out, "CheckExtension     : {}", field(port.check_extension()));
    let _ = writeln!(out, "Port ID            : {}", field(port.port_id()));
    let _ = writeln!(out, "AFU UUID           : {}", field(port.accelerator_type_uuid()));
    let _ = writeln!(out, "Interface UUID     : {}", field(port.interface_uuid()));

    match port.info() {
        Ok(info) => {
            let _ = writeln!(
                out,
                "PortGetInfo        : flags={:#x} regions={} umsgs={}",
                info.flags, info.num_regions, info.num_umsgs
            );
            for index in 0..info.num_regions {
                let _ = writeln!(
                    out,
                    "PortGetRegionInfo {index}: {}",
                    field(port.region_info(index).map(|r| format!(
                        "flags={:#x} size={:#x} offset={:#x}",
                        r.flags, r.size, r.offset
                    )))
                );
            }
        }
        Err(e) => {
            let _ = writeln!(out, "PortGetInfo        : <{e}>");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const INTERFACE: &str = "ce48969398f05f33946d560708be108a";
    const AFU: &str = "d8424dc4a4a3c413f89e433683f9040b";

    fn gbs_file(dir: &Path) -> std::path::PathBuf {
        let metadata = format!(
            r#"{{"version":640,"afu-image":{{"interface-uuid":"{INTERFACE}","magic-no":488605312,"accelerator-clusters":[{{"total-contexts":1,"name":"nlb0","accelerator-type-uuid":"{AFU}"}}]}}}}"#
        );
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x414750466e6f6558u64.to_le_bytes());
        bytes.extend_from_slice(&0x31303076534247b7u64.to_le_bytes());
        bytes.extend_from_slice(&u32::try_from(metadata.len()).expect("fits").to_le_bytes());
        bytes.extend_from_slice(metadata.as_bytes());
        bytes.extend_from_slice(b"payload");

        let path = dir.join("nlb0.gbs");
        fs::write(&path, bytes).expect("should write gbs");
        path
    }

    #[test]
    fn test_describe_bitstream() {
        let dir = TempDir::new().expect("should create temp dir");
        let path = gbs_file(dir.path());
        let bitstream = bitstream::open(&path).expect("should open");

        let text = describe_bitstream(bitstream.as_ref(), &path, Path::new("/srv/intel.com/fpga"));
        assert!(text.contains(&format!("Interface UUID        : \"{INTERFACE}\"")));
        assert!(text.contains(&format!("Unique UUID           : \"{AFU}\"")));
        assert!(text.contains(&format!("/srv/intel.com/fpga/{INTERFACE}/{AFU}.gbs")));
        assert!(text.contains("\tSize : \"7\""));
    }

    #[test]
    fn test_fpgainfo_lists_platform_devices() {
        let dir = TempDir::new().expect("should create temp dir");
        for name in ["dfl-fme.0", "dfl-port.0", "dfl-port.1", "serial8250"] {
            fs::create_dir(dir.path().join(name)).expect("should create dir");
        }

        let (fmes, ports) = device::list_fpga_devices(dir.path()).expect("should list");
        assert_eq!(
            describe_device_list(&fmes, &ports),
            "FMEs  : dfl-fme.0\nPorts : dfl-port.0 dfl-port.1\n"
        );

        let missing = fpgainfo(DeviceArgs {
            device: None,
            reset: false,
            platform_dir: dir.path().join("missing"),
        });
        assert!(missing.is_err());
    }

    #[test]
    fn test_install_dry_run_copies_nothing() {
        let dir = TempDir::new().expect("should create temp dir");
        let path = gbs_file(dir.path());
        let store = dir.path().join("store");

        install(InstallArgs {
            bitstream: BitstreamArgs {
                bitstream: path,
                bitstream_dir: store.clone(),
            },
            dry_run: true,
        })
        .expect("dry run should succeed");
        assert!(!store.exists());
    }
}
