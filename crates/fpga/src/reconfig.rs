//! Partial reconfiguration of a port with UUID compatibility checking.

use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::bitstream;
use crate::bitstream::Bitstream;
use crate::device::DeviceError;
use crate::device::DeviceResult;
use crate::device::Port;
use crate::identity::canonize_id;

/// Result of a successful [`program`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Outcome {
    /// The bitstream is compatible, hardware was left untouched.
    #[display("validated")]
    Validated,
    /// The bitstream was written to the device.
    #[display("programmed")]
    Programmed,
    /// The requested AFU was already loaded, nothing was written.
    #[display("already programmed")]
    AlreadyProgrammed,
}

/// Programs `bitstream` into the region behind `port`.
///
/// The owning FME must report the interface UUID the bitstream was built
/// against, otherwise nothing is written. With `dry_run` the checks run but the
/// PR request is never issued. Driver errors are returned as is; a failed PR
/// may leave the region in an undefined state and is not retried.
pub fn program<P: Port + ?Sized>(
    port: &P,
    bitstream: &dyn Bitstream,
    dry_run: bool,
) -> DeviceResult<Outcome> {
    let fme = port.fme()?;

    let fme_interface = fme.interface_uuid()?;
    let bitstream_interface = bitstream.interface_uuid();
    if fme_interface != bitstream_interface {
        return Err(Report::new(DeviceError::IncompatibleInterface {
            fme: fme_interface,
            bitstream: bitstream_interface,
        }));
    }

    let port_id = port.port_id()?;
    let data = bitstream
        .raw_data()
        .change_context(DeviceError::Bitstream)?;

    if dry_run {
        info!(
            port = %port.dev_path().display(),
            port_id,
            afu_uuid = %bitstream.accelerator_type_uuid(),
            "dry run: bitstream is compatible, skipping PR"
        );
        return Ok(Outcome::Validated);
    }

    if let Err(e) = fme.port_pr(port_id, &data) {
        error!(
            fme = %fme.dev_path().display(),
            port_id,
            "partial reconfiguration failed: {e:?}"
        );
        return Err(e);
    }

    info!(
        port = %port.dev_path().display(),
        port_id,
        afu_uuid = %bitstream.accelerator_type_uuid(),
        "programmed bitstream"
    );

    Ok(Outcome::Programmed)
}

/// Makes sure the region behind `port` runs `afu`.
///
/// Nothing is written when the port already reports `afu`. Otherwise the
/// image `{bitstream_dir}/{interface}/{afu}.{gbs,aocx}` is programmed and
/// the port's AFU UUID is read back to confirm the switch.
pub fn program_afu<P: Port + ?Sized>(
    port: &P,
    bitstream_dir: &Path,
    afu: &str,
    dry_run: bool,
) -> DeviceResult<Outcome> {
    let requested = canonize_id(afu);

    let current = port.accelerator_type_uuid()?;
    if current == requested {
        debug!(port = %port.dev_path().display(), afu = %requested, "AFU already programmed");
        return Ok(Outcome::AlreadyProgrammed);
    }

    let region = port.interface_uuid()?;
    let bitstream = bitstream::find(bitstream_dir, &region, &requested)
        .change_context(DeviceError::Bitstream)?;
    let image_afu = bitstream.accelerator_type_uuid();
    if image_afu != requested {
        return Err(Report::new(DeviceError::AfuMismatch {
            requested,
            bitstream: image_afu,
        }));
    }

    let outcome = program(port, bitstream.as_ref(), dry_run)?;
    if outcome != Outcome::Programmed {
        return Ok(outcome);
    }

    let programmed = port.accelerator_type_uuid()?;
    if programmed != requested {
        return Err(Report::new(DeviceError::UnexpectedAfu {
            programmed,
            requested,
        }));
    }

    Ok(outcome)
}
