use std::path::PathBuf;

use structopt::clap::AppSettings::*;
use structopt::StructOpt;

mod commands;
mod error;

#[derive(Debug, StructOpt)]
enum Commands {
    #[structopt(
        name = "capture",
        visible_alias = "c",
        about = "Capture a directory tree as a new image"
    )]
    Capture {
        #[structopt(parse(from_os_str), help = "Directory to capture")]
        source: PathBuf,

        #[structopt(
            name = "wimfile",
            parse(from_os_str),
            help = "WIM file to create, or to append to if it exists"
        )]
        path: PathBuf,

        #[structopt(long, help = "Image name [default: source directory name]")]
        name: Option<String>,

        #[structopt(
            long,
            default_value = "",
            hide_default_value = true,
            help = "Image description"
        )]
        description: String,

        #[structopt(long, help = "Write an integrity table")]
        check: bool,

        #[structopt(long, help = "Store UNIX owner, group and mode")]
        unix_data: bool,

        #[structopt(long, help = "Fix up absolute symlink targets inside the captured tree")]
        rpfix: bool,

        #[structopt(long, help = "Make the new image bootable")]
        boot: bool,
    },

    #[structopt(
        name = "apply",
        visible_alias = "a",
        about = "Apply an image, or all images, to a directory"
    )]
    Apply {
        #[structopt(name = "wimfile", parse(from_os_str), help = "Path to the WIM file")]
        path: PathBuf,

        #[structopt(
            name = "image-and-target",
            parse(from_os_str),
            required = true,
            min_values = 1,
            max_values = 2,
            help = "[IMAGE] TARGET: optional image index, name or `all`, then the target directory"
        )]
        image_and_target: Vec<PathBuf>,

        #[structopt(long, help = "Hard link identical files instead of copying them")]
        hardlink: bool,

        #[structopt(long, help = "Symlink identical files instead of copying them")]
        symlink: bool,

        #[structopt(long, help = "Read streams in on-disk order")]
        sequential: bool,

        #[structopt(long, help = "Restore UNIX owner, group and mode")]
        unix_data: bool,

        #[structopt(long, help = "Fix up absolute symlink targets")]
        rpfix: bool,

        #[structopt(long, conflicts_with = "rpfix", help = "Keep symlink targets as stored")]
        norpfix: bool,

        #[structopt(long = "ref", parse(from_os_str), help = "Additional parts of a split WIM")]
        parts: Vec<PathBuf>,
    },

    #[structopt(
        name = "extract",
        visible_alias = "x",
        about = "Extract files or directories from an image"
    )]
    Extract {
        #[structopt(name = "wimfile", parse(from_os_str), help = "Path to the WIM file")]
        path: PathBuf,

        #[structopt(name = "image", help = "Image index or name")]
        image: String,

        #[structopt(name = "paths", required = true, help = "Paths inside the image")]
        paths: Vec<String>,

        #[structopt(long, parse(from_os_str), default_value = ".", help = "Destination directory")]
        dest: PathBuf,

        #[structopt(long, help = "Write file content to standard output")]
        to_stdout: bool,

        #[structopt(long, help = "Restore UNIX owner, group and mode")]
        unix_data: bool,

        #[structopt(long = "ref", parse(from_os_str), help = "Additional parts of a split WIM")]
        parts: Vec<PathBuf>,
    },

    #[structopt(
        name = "info",
        visible_alias = "i",
        about = "Show or change WIM and image information"
    )]
    Info {
        #[structopt(name = "wimfile", parse(from_os_str), help = "Path to the WIM file")]
        path: PathBuf,

        #[structopt(name = "image", help = "Image index or name")]
        image: Option<String>,

        #[structopt(long, help = "Mark an image bootable (0 for none)")]
        boot: Option<u32>,

        #[structopt(long, requires = "image", help = "Rename the image")]
        name: Option<String>,

        #[structopt(long, requires = "image", help = "Change the image description")]
        description: Option<String>,

        #[structopt(long, help = "Verify the integrity table, or add one when changing the WIM")]
        check: bool,

        #[structopt(long, help = "Print as JSON")]
        json: bool,
    },

    #[structopt(name = "optimize", about = "Rewrite the WIM, dropping unreferenced data")]
    Optimize {
        #[structopt(name = "wimfile", parse(from_os_str), help = "Path to the WIM file")]
        path: PathBuf,

        #[structopt(long, help = "Write an integrity table")]
        check: bool,
    },
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "wim",
    about = "Capture, apply and rewrite Windows Imaging (WIM) archives.",
    settings = &[SubcommandRequiredElseHelp, DisableHelpSubcommand, VersionlessSubcommands],
)]
struct CliOpts {
    #[structopt(short, long, help = "Show verbose output", global = true)]
    verbose: bool,

    #[structopt(subcommand)]
    cmd: Commands,
}

fn main() -> anyhow::Result<()> {
    let opts = CliOpts::from_iter(wild::args_os());

    tracing_subscriber::fmt()
        .with_max_level(if opts.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    let verbose = opts.verbose;
    match opts.cmd {
        Commands::Capture {
            source,
            path,
            name,
            description,
            check,
            unix_data,
            rpfix,
            boot,
        } => commands::capture(commands::CaptureArgs {
            source,
            path,
            name,
            description,
            check,
            unix_data,
            rpfix,
            boot,
            verbose,
        })?,
        Commands::Apply {
            path,
            mut image_and_target,
            hardlink,
            symlink,
            sequential,
            unix_data,
            rpfix,
            norpfix,
            parts,
        } => {
            // Bounded to one or two values by the argument parser.
            let target = image_and_target.pop().unwrap_or_default();
            let image = image_and_target
                .pop()
                .map(|image| image.to_string_lossy().into_owned());
            commands::apply(commands::ApplyArgs {
                path,
                image,
                target,
                hardlink,
                symlink,
                sequential,
                unix_data,
                rpfix,
                norpfix,
                parts,
                verbose,
            })?
        }
        Commands::Extract {
            path,
            image,
            paths,
            dest,
            to_stdout,
            unix_data,
            parts,
        } => commands::extract(commands::ExtractArgs {
            path,
            image,
            paths,
            dest,
            to_stdout,
            unix_data,
            parts,
            verbose,
        })?,
        Commands::Info {
            path,
            image,
            boot,
            name,
            description,
            check,
            json,
        } => commands::info(commands::InfoArgs {
            path,
            image,
            boot,
            name,
            description,
            check,
            json,
        })?,
        Commands::Optimize { path, check } => commands::optimize(path, check, verbose)?,
    }

    Ok(())
}
