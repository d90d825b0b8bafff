use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use flate2::read::GzDecoder;
use object::BinaryFormat;
use object::Object;
use object::ObjectSection;

use super::install_path_for;
use super::Bitstream;
use super::BitstreamError;
use super::BitstreamResult;
use super::Gbs;
use super::ReadSeek;
use super::AOCX_EXTENSION;

/// AFU UUID shared by every OpenCL BSP based bitstream.
pub const OPENCL_UUID: &str = "18b79ffa2ee54aa096ef4230dafacb5f";

const FPGA_BIN_SECTION: &str = ".acl.fpga.bin";
const GBS_GZ_SECTION: &str = ".acl.gbs.gz";

/// An OpenCL compiler output file.
#[derive(Debug, Default)]
pub struct Aocx {
    pub auto_discovery: String,
    pub auto_discovery_xml: String,
    pub board: String,
    pub board_package: String,
    pub board_spec_xml: String,
    pub compilation_environment: String,
    /// Compiler-assigned random hash, the unique ID of the image.
    pub hash: String,
    pub kernel_arg_info_xml: String,
    pub quartus_input_hash: String,
    pub quartus_report: String,
    pub target: String,
    pub version: String,
    pub gbs: Option<Gbs>,
}

impl Aocx {
    pub fn open(path: &Path) -> BitstreamResult<Self> {
        let data = fs::read(path).change_context_lazy(|| BitstreamError::Open {
            path: path.to_path_buf(),
        })?;
        Self::parse(&data).attach_printable_lazy(|| format!("parsing {}", path.display()))
    }

    /// Parses an AOCX ELF container held in memory.
    pub fn parse(data: &[u8]) -> BitstreamResult<Self> {
        let elf = parse_elf(data)?;

        let mut aocx = Self::default();
        for section in elf.sections() {
            let name = section.name().change_context(BitstreamError::Elf)?;

            if name == FPGA_BIN_SECTION {
                let bin = section
                    .data()
                    .change_context(BitstreamError::Elf)
                    .attach_printable("unable to read .acl.fpga.bin")?;
                aocx.gbs = Some(parse_fpga_bin(bin).attach_printable("unable to parse gbs")?);
                continue;
            }

            let Some(field) = aocx.field_mut(name) else {
                continue;
            };
            let value = section
                .data()
                .change_context(BitstreamError::Elf)
                .attach_printable_lazy(|| format!("{name}: unable to get section data"))?;
            *field = String::from_utf8_lossy(value).trim().to_string();
        }

        Ok(aocx)
    }

    fn field_mut(&mut self, section: &str) -> Option<&mut String> {
        let field = match section {
            ".acl.autodiscovery" => &mut self.auto_discovery,
            ".acl.autodiscovery.xml" => &mut self.auto_discovery_xml,
            ".acl.board" => &mut self.board,
            ".acl.board_package" => &mut self.board_package,
            ".acl.board_spec.xml" => &mut self.board_spec_xml,
            ".acl.compilation_env" => &mut self.compilation_environment,
            ".acl.rand_hash" => &mut self.hash,
            ".acl.kernel_arg_info.xml" => &mut self.kernel_arg_info_xml,
            ".acl.quartus_input_hash" => &mut self.quartus_input_hash,
            ".acl.quartus_report" => &mut self.quartus_report,
            ".acl.target" => &mut self.target,
            ".acl.version" => &mut self.version,
            _ => return None,
        };
        Some(field)
    }

    fn embedded_gbs(&self) -> BitstreamResult<&Gbs> {
        self.gbs.as_ref().ok_or_else(|| {
            Report::new(BitstreamError::MissingSection {
                section: FPGA_BIN_SECTION,
                container: "AOCX file",
            })
        })
    }
}

fn parse_elf(data: &[u8]) -> BitstreamResult<object::File<'_>> {
    let elf = object::File::parse(data).change_context(BitstreamError::Elf)?;
    if elf.format() != BinaryFormat::Elf {
        return Err(Report::new(BitstreamError::Elf)
            .attach_printable(format!("unexpected container format {:?}", elf.format())));
    }
    Ok(elf)
}

/// Extracts the GBS image embedded in the contents of an `.acl.fpga.bin`
/// section.
///
/// The section is itself an ELF file whose `.acl.gbs.gz` section holds the
/// gzip-compressed GBS. The GBS must carry the OpenCL BSP AFU UUID.
pub fn parse_fpga_bin(data: &[u8]) -> BitstreamResult<Gbs> {
    let elf = parse_elf(data)?;
    let section = elf.section_by_name(GBS_GZ_SECTION).ok_or_else(|| {
        Report::new(BitstreamError::MissingSection {
            section: GBS_GZ_SECTION,
            container: FPGA_BIN_SECTION,
        })
    })?;
    let compressed = section.data().change_context(BitstreamError::Elf)?;

    let mut raw = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut raw)
        .change_context(BitstreamError::Decompress)?;

    let gbs = Gbs::from_bytes(raw)?;
    let afu_uuid = gbs.accelerator_type_uuid();
    if afu_uuid != OPENCL_UUID {
        return Err(Report::new(BitstreamError::OpenClUuid { afu_uuid }));
    }

    Ok(gbs)
}

impl Bitstream for Aocx {
    fn raw_reader(&self) -> BitstreamResult<Box<dyn ReadSeek + '_>> {
        self.embedded_gbs()?.raw_reader()
    }

    fn raw_data(&self) -> BitstreamResult<Vec<u8>> {
        self.embedded_gbs()?.raw_data()
    }

    fn interface_uuid(&self) -> String {
        self.gbs
            .as_ref()
            .map(|gbs| gbs.interface_uuid())
            .unwrap_or_default()
    }

    fn accelerator_type_uuid(&self) -> String {
        self.gbs
            .as_ref()
            .map(|gbs| gbs.accelerator_type_uuid())
            .unwrap_or_default()
    }

    fn unique_uuid(&self) -> String {
        self.hash.clone()
    }

    fn install_path(&self, root: &Path) -> Option<PathBuf> {
        install_path_for(
            root,
            &self.interface_uuid(),
            &self.unique_uuid(),
            AOCX_EXTENSION,
        )
    }

    fn extra_metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::from([
            ("Board".to_string(), self.board.clone()),
            ("Target".to_string(), self.target.clone()),
            ("Hash".to_string(), self.hash.clone()),
            ("Version".to_string(), self.version.clone()),
        ]);
        if let Some(gbs) = &self.gbs {
            metadata.insert("Size".to_string(), gbs.payload_size().to_string());
        }
        metadata
    }
}
