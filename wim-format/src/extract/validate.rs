use super::apply::BackendCapabilities;
use super::{ExtractCommand, ExtractFlags};
use crate::error::{Error, Result};
use crate::header::HeaderFlags;

fn invalid(msg: &str) -> Error {
    tracing::error!("{}", msg);
    Error::InvalidParameter(msg.to_string())
}

/// Checks one extraction command and fills in defaulted flags.
///
/// `platform` describes what the native filesystem supports and
/// `volume_available` whether a volume mounter was supplied for `NTFS`.
pub fn check_extract_command(
    cmd: &mut ExtractCommand,
    header_flags: HeaderFlags,
    platform: BackendCapabilities,
    volume_available: bool,
) -> Result<()> {
    let mut flags = cmd.flags;
    let is_entire_image = cmd
        .source_path
        .trim_matches(|c: char| c == '/' || c == '\\')
        .is_empty();

    if cmd.dest_path.as_os_str().is_empty() {
        return Err(Error::InvalidParameter("extraction target must not be empty".into()));
    }

    if flags.contains(ExtractFlags::SYMLINK | ExtractFlags::HARDLINK) {
        return Err(invalid("Cannot combine symlink and hardlink extraction modes"));
    }

    if flags.contains(ExtractFlags::UNIX_DATA) && !platform.unix_data {
        return Err(invalid("UNIX data cannot be extracted on this platform"));
    }
    if flags.is_link_mode() && !platform.link_extraction {
        return Err(invalid(
            "Symlink and hardlink extraction modes are not supported on this platform",
        ));
    }

    if flags.contains(ExtractFlags::NTFS) {
        if !volume_available {
            tracing::error!("Extracting to a mounted volume requires a volume mounter");
            return Err(Error::UnsupportedFeature("no volume mounter is available".into()));
        }
        if flags.is_link_mode() {
            return Err(invalid(
                "Cannot specify symlink or hardlink flags when applying to a volume",
            ));
        }
        if !is_entire_image {
            return Err(invalid("When applying to a volume, only a full image can be extracted"));
        }
        if flags.contains(ExtractFlags::UNIX_DATA) {
            return Err(invalid("Cannot restore UNIX-specific data when applying to a volume"));
        }
    }

    if flags.contains(ExtractFlags::RPFIX | ExtractFlags::NORPFIX) {
        return Err(invalid("Cannot specify RPFIX and NORPFIX flags at the same time"));
    }

    if !flags.intersects(ExtractFlags::RPFIX | ExtractFlags::NORPFIX)
        && header_flags.contains(HeaderFlags::RP_FIX)
        && is_entire_image
    {
        flags.insert(ExtractFlags::RPFIX);
    }

    if flags.contains(ExtractFlags::RPFIX) && !is_entire_image {
        return Err(invalid(
            "Reparse point fixups can only be applied when extracting a full image",
        ));
    }

    cmd.flags = flags;
    Ok(())
}

/// Rejects a batch that mixes link-mode and copy-mode commands.
pub(crate) fn check_batch_link_modes(cmds: &[ExtractCommand]) -> Result<()> {
    let mut link = false;
    let mut nolink = false;
    for cmd in cmds {
        if cmd.flags.is_link_mode() {
            link = true;
        } else {
            nolink = true;
        }
        if link && nolink {
            return Err(invalid(
                "Symlink or hardlink extraction mode must be set on all extraction commands",
            ));
        }
    }
    Ok(())
}
