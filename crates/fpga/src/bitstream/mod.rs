//! Bitstream containers: GBS images and OpenCL AOCX files wrapping them.

use core::error::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::io::Seek;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

mod aocx;
mod gbs;

pub use aocx::parse_fpga_bin;
pub use aocx::Aocx;
pub use aocx::OPENCL_UUID;
pub use gbs::AcceleratorCluster;
pub use gbs::AfuImage;
pub use gbs::Gbs;
pub use gbs::Header;
pub use gbs::Metadata;
pub use gbs::PayloadReader;

#[cfg(test)]
pub(crate) use gbs::tests::gbs_bytes as gbs_test_bytes;

pub const GBS_EXTENSION: &str = "gbs";
pub const AOCX_EXTENSION: &str = "aocx";

pub type BitstreamResult<T> = Result<T, Report<BitstreamError>>;

#[derive(Debug, derive_more::Display)]
pub enum BitstreamError {
    #[display("unable to open {}", path.display())]
    Open { path: PathBuf },
    #[display("unsupported file format {}", path.display())]
    UnsupportedFormat { path: PathBuf },
    #[display("unable to read header")]
    Header,
    #[display(
        "wrong magic in GBS file: {guid1:#x} {guid2:#x}, expected {:#x} {:#x}",
        gbs::GBS_GUID1,
        gbs::GBS_GUID2
    )]
    WrongMagic { guid1: u64, guid2: u64 },
    #[display("incorrect length of GBS metadata {length}")]
    MetadataLength { length: u32 },
    #[display("unable to parse GBS metadata")]
    Metadata,
    #[display("incorrect length of AcceleratorClusters in GBS metadata: {count}")]
    ClusterCount { count: usize },
    #[display("unable to read bitstream payload")]
    Payload,
    #[display("unable to parse ELF container")]
    Elf,
    #[display("no {section} section in {container}")]
    MissingSection {
        section: &'static str,
        container: &'static str,
    },
    #[display("unable to uncompress .acl.gbs.gz")]
    Decompress,
    #[display("incorrect OpenCL BSP AFU UUID ({afu_uuid})")]
    OpenClUuid { afu_uuid: String },
    #[display("bitstream not found for region {region} and AFU {afu}")]
    NotFound { region: String, afu: String },
    #[display("unable to install bitstream to {}", path.display())]
    Install { path: PathBuf },
}

impl Error for BitstreamError {}

/// Reader over a raw bitstream payload.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Identity and payload access shared by all supported container formats.
///
/// Dropping the value releases the underlying file.
pub trait Bitstream: fmt::Debug + Send {
    /// Seekable reader over the raw payload. Each call gets an independent
    /// cursor.
    fn raw_reader(&self) -> BitstreamResult<Box<dyn ReadSeek + '_>>;

    /// Reads the whole raw payload.
    fn raw_data(&self) -> BitstreamResult<Vec<u8>>;

    /// Interface UUID of the FPGA shell the image was built against.
    fn interface_uuid(&self) -> String;

    /// AFU UUID of the accelerator the image implements.
    fn accelerator_type_uuid(&self) -> String;

    /// UUID that uniquely identifies this image.
    fn unique_uuid(&self) -> String;

    /// `root/{interface}/{unique}.{ext}`, `None` when either ID is empty.
    fn install_path(&self, root: &Path) -> Option<PathBuf>;

    /// Additional descriptive key/value pairs.
    fn extra_metadata(&self) -> BTreeMap<String, String>;
}

pub(crate) fn install_path_for(
    root: &Path,
    interface_id: &str,
    unique_id: &str,
    extension: &str,
) -> Option<PathBuf> {
    if interface_id.is_empty() || unique_id.is_empty() {
        return None;
    }
    Some(
        root.join(interface_id)
            .join(format!("{unique_id}.{extension}")),
    )
}

/// Opens a bitstream, picking the container format from the file extension.
pub fn open(path: &Path) -> BitstreamResult<Box<dyn Bitstream>> {
    let extension = path.extension().and_then(|e| e.to_str());
    let bitstream: Box<dyn Bitstream> = match extension {
        Some(GBS_EXTENSION) => Box::new(Gbs::open(path)?),
        Some(AOCX_EXTENSION) => Box::new(Aocx::open(path)?),
        _ => {
            return Err(Report::new(BitstreamError::UnsupportedFormat {
                path: path.to_path_buf(),
            }))
        }
    };

    debug!(
        path = %path.display(),
        interface_uuid = %bitstream.interface_uuid(),
        afu_uuid = %bitstream.accelerator_type_uuid(),
        "opened bitstream"
    );

    Ok(bitstream)
}

/// Returns the first existing `{dir}/{region}/{afu}.gbs` or `.aocx`.
pub fn locate(bitstream_dir: &Path, region: &str, afu: &str) -> BitstreamResult<PathBuf> {
    [GBS_EXTENSION, AOCX_EXTENSION]
        .iter()
        .map(|ext| bitstream_dir.join(region).join(format!("{afu}.{ext}")))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            Report::new(BitstreamError::NotFound {
                region: region.to_string(),
                afu: afu.to_string(),
            })
            .attach_printable(format!("searched in {}", bitstream_dir.display()))
        })
}

/// Opens the bitstream for `region`/`afu` stored under `bitstream_dir`.
pub fn find(bitstream_dir: &Path, region: &str, afu: &str) -> BitstreamResult<Box<dyn Bitstream>> {
    open(&locate(bitstream_dir, region, afu)?)
}

/// Copies `source` to the canonical install path of `bitstream` under `root`.
///
/// Returns the destination. With `dry_run` nothing is written.
pub fn install(
    bitstream: &dyn Bitstream,
    source: &Path,
    root: &Path,
    dry_run: bool,
) -> BitstreamResult<PathBuf> {
    let destination = bitstream.install_path(root).ok_or_else(|| {
        Report::new(BitstreamError::Install {
            path: root.to_path_buf(),
        })
        .attach_printable("bitstream has no interface or unique UUID")
    })?;

    if dry_run {
        info!(
            source = %source.display(),
            destination = %destination.display(),
            "dry run: bitstream not installed"
        );
        return Ok(destination);
    }

    let install_err = || BitstreamError::Install {
        path: destination.clone(),
    };
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).change_context_lazy(install_err)?;
    }
    fs::copy(source, &destination).change_context_lazy(install_err)?;

    info!(
        source = %source.display(),
        destination = %destination.display(),
        "installed bitstream"
    );

    Ok(destination)
}
