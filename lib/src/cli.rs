//! # Image mutation CLI
//!
//! Command line tool to modify OCI images without a container runtime.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Read;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use oci_spec::image::{Arch, History, HistoryBuilder, MediaType, Os};
use tokio_util::sync::CancellationToken;

use crate::cas::CasDir;
use crate::casext::refname;
use crate::casext::Engine;
use crate::layer::idmap::{IdMapping, MapOptions};
use crate::layer::unpack::UnpackOptions;
use crate::layer::{pack, Compression};
use crate::mutate::Mutator;
use crate::repack::RepackOptions;
use crate::{runtime, timeutil, Error};

/// An image layout plus a tag, written `path[:tag]` on the command line.
#[derive(Debug, Clone)]
pub(crate) struct ImageRef {
    pub(crate) layout: Utf8PathBuf,
    pub(crate) tag: String,
}

impl std::str::FromStr for ImageRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (layout, tag) = match s.rsplit_once(':') {
            Some((layout, tag)) => {
                if layout.is_empty() {
                    bail!(Error::invalid(format!("empty layout path in {s:?}")));
                }
                (layout, refname::validate(tag)?)
            }
            None => (s, "latest"),
        };
        Ok(Self {
            layout: Utf8PathBuf::from(layout),
            tag: tag.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            // tracing has no fatal level; both map to error
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CompressArg {
    Auto,
    None,
    Gzip,
    Zstd,
}

impl CompressArg {
    fn resolve(self) -> Option<Compression> {
        match self {
            CompressArg::Auto => None,
            CompressArg::None => Some(Compression::None),
            CompressArg::Gzip => Some(Compression::Gzip),
            CompressArg::Zstd => Some(Compression::Zstd),
        }
    }
}

/// Flags shaping the history entry a mutating command records.
#[derive(Debug, clap::Args)]
struct HistoryFlags {
    /// Author of the history entry.
    #[clap(id = "history.author", long = "history.author")]
    author: Option<String>,
    /// Comment attached to the history entry.
    #[clap(id = "history.comment", long = "history.comment")]
    comment: Option<String>,
    /// Creation time (RFC 3339) of the history entry.
    #[clap(id = "history.created", long = "history.created")]
    created: Option<String>,
    /// The command the history entry attributes the change to.
    #[clap(id = "history.created_by", long = "history.created_by")]
    created_by: Option<String>,
}

impl HistoryFlags {
    fn to_history(&self, default_created_by: &str) -> Result<History> {
        let created = match &self.created {
            Some(s) => timeutil::parse_rfc3339(s)?,
            None => timeutil::now()?,
        };
        let mut builder = HistoryBuilder::default()
            .created(timeutil::format_rfc3339(&created))
            .created_by(
                self.created_by
                    .clone()
                    .unwrap_or_else(|| default_created_by.to_string()),
            );
        if let Some(author) = &self.author {
            builder = builder.author(author.clone());
        }
        if let Some(comment) = &self.comment {
            builder = builder.comment(comment.clone());
        }
        Ok(builder.build()?)
    }
}

/// Flags shared by commands that translate ownership.
#[derive(Debug, clap::Args)]
struct MapFlags {
    /// Enable unprivileged mode (ownership and device nodes are emulated).
    #[clap(long)]
    rootless: bool,
    /// uid mapping, `container:host:size` (may repeat).
    #[clap(long = "uid-map")]
    uid_map: Vec<IdMapping>,
    /// gid mapping, `container:host:size` (may repeat).
    #[clap(long = "gid-map")]
    gid_map: Vec<IdMapping>,
}

impl MapFlags {
    fn to_map_options(&self) -> MapOptions {
        MapOptions {
            uid_mappings: self.uid_map.clone(),
            gid_mappings: self.gid_map.clone(),
            rootless: self.rootless,
        }
    }
}

/// `Config.*` edits for the config subcommand.
#[derive(Debug, clap::Args)]
struct ConfigFlags {
    /// Set the user (`user[:group]`) the image runs as.
    #[clap(long = "config.user")]
    user: Option<String>,
    /// Add an exposed port (may repeat).
    #[clap(long = "config.exposedports")]
    exposed_ports: Vec<String>,
    /// Set an environment variable, `KEY=VALUE` (may repeat; replaces an
    /// existing KEY).
    #[clap(long = "config.env")]
    env: Vec<String>,
    /// Replace the entrypoint (repeat for each argument).
    #[clap(long = "config.entrypoint")]
    entrypoint: Vec<String>,
    /// Replace the default command (repeat for each argument).
    #[clap(long = "config.cmd")]
    cmd: Vec<String>,
    /// Add a volume path (may repeat).
    #[clap(long = "config.volume")]
    volume: Vec<String>,
    /// Add a label, `KEY=VALUE` (may repeat).
    #[clap(long = "config.label")]
    label: Vec<String>,
    /// Set the working directory.
    #[clap(long = "config.workingdir")]
    working_dir: Option<String>,
    /// Set the stop signal.
    #[clap(long = "config.stopsignal")]
    stop_signal: Option<String>,
}

fn parse_kv(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| Error::invalid(format!("expected KEY=VALUE, got {s:?}")))?;
    Ok((k.to_string(), v.to_string()))
}

/// Modify OCI container images without a container runtime.
///
/// Images are plain directories in the OCI image-layout format; unpack a
/// tag into a rootfs you can edit with ordinary tools, then repack the
/// changes as a new layer.
#[derive(Debug, Parser)]
#[clap(name = "umoci")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) struct Cli {
    /// Log level.
    #[clap(long, global = true, value_enum)]
    log: Option<LogLevel>,
    /// Alias for `--log=info`.
    #[clap(long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Opt,
}

#[derive(Debug, clap::Subcommand)]
#[allow(clippy::large_enum_variant)]
pub(crate) enum Opt {
    /// Create a new empty OCI image layout.
    Init {
        /// Path for the new layout; must not exist.
        #[clap(long)]
        layout: Utf8PathBuf,
    },
    /// Create a new empty image (no layers) under a tag.
    New {
        /// Image to create, `path:tag`.
        #[clap(long)]
        image: ImageRef,
    },
    /// Extract an image tag into a runtime bundle.
    Unpack {
        /// Source image, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Keep symlinks to directories when layers carry directories of
        /// the same name.
        #[clap(long)]
        keep_dirlinks: bool,
        #[clap(flatten)]
        map: MapFlags,
        /// Bundle directory to create (overwritten if present).
        bundle: Utf8PathBuf,
    },
    /// Pack the changes made to a bundle as a new layer under a tag.
    Repack {
        /// Destination image, `path[:tag]`; the source is recorded in the
        /// bundle.
        #[clap(long)]
        image: ImageRef,
        /// Additional path to exclude from the layer (may repeat).
        #[clap(long = "mask-path")]
        mask_path: Vec<Utf8PathBuf>,
        /// Do not mask the config's volume paths.
        #[clap(long)]
        no_mask_volumes: bool,
        /// Update the bundle metadata to point at the new image.
        #[clap(long)]
        refresh_bundle: bool,
        /// Layer compression.
        #[clap(long, value_enum, default_value = "auto")]
        compress: CompressArg,
        /// Do not record a history entry.
        #[clap(long, conflicts_with_all = ["history.author", "history.comment", "history.created", "history.created_by"])]
        no_history: bool,
        #[clap(flatten)]
        history: HistoryFlags,
        /// Bundle directory to read changes from.
        bundle: Utf8PathBuf,
    },
    /// Edit image configuration and manifest metadata.
    Config {
        /// Image to edit, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Tag to store the result under (defaults to the source tag).
        #[clap(long)]
        tag: Option<String>,
        #[clap(flatten)]
        config: ConfigFlags,
        /// Reset a field (e.g. `config.env`, `config.labels`,
        /// `manifest.annotations`); may repeat.
        #[clap(long)]
        clear: Vec<String>,
        /// Set the image creation time (RFC 3339).
        #[clap(long)]
        created: Option<String>,
        /// Set the image author.
        #[clap(long)]
        author: Option<String>,
        /// Set the image architecture.
        #[clap(long)]
        architecture: Option<String>,
        /// Set the image operating system.
        #[clap(long)]
        os: Option<String>,
        /// Add a manifest annotation, `KEY=VALUE` (may repeat).
        #[clap(long = "manifest.annotation")]
        manifest_annotation: Vec<String>,
        #[clap(flatten)]
        history: HistoryFlags,
    },
    /// Insert a file or directory tree into an image as a new layer.
    Insert {
        /// Image to modify, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Shadow all existing content under the target directory.
        #[clap(long)]
        opaque: bool,
        /// Instead of inserting content, delete this path from the image.
        #[clap(long, conflicts_with_all = ["source", "target", "opaque"])]
        whiteout: Option<Utf8PathBuf>,
        #[clap(flatten)]
        history: HistoryFlags,
        /// Source file or directory on the host.
        #[clap(required_unless_present = "whiteout")]
        source: Option<Utf8PathBuf>,
        /// Destination path inside the image.
        #[clap(required_unless_present = "whiteout")]
        target: Option<Utf8PathBuf>,
    },
    /// Remove unreferenced blobs and stale scratch directories.
    Gc {
        /// Image layout to collect.
        #[clap(long)]
        layout: Utf8PathBuf,
    },
    /// Describe an image: layers joined with their history.
    Stat {
        /// Image to describe, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Emit JSON instead of a table.
        #[clap(long)]
        json: bool,
    },
    /// Manipulate tags in the top-level index.
    #[clap(subcommand)]
    Tag(TagOpt),
    /// Lower-level operations that skip bundle bookkeeping.
    #[clap(subcommand)]
    Raw(RawOpt),
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum TagOpt {
    /// Point a tag at an existing blob.
    Add {
        /// Image layout, `path[:tag]` (the tag part is ignored).
        #[clap(long)]
        image: ImageRef,
        /// The tag to create or move.
        #[clap(long)]
        tag: String,
        /// Digest of the blob to reference.
        #[clap(long)]
        blob: String,
        /// Media type recorded in the descriptor.
        #[clap(long, default_value = "application/vnd.oci.image.manifest.v1+json")]
        media_type: String,
    },
    /// List all tags.
    List {
        /// Image layout, `path[:tag]` (the tag part is ignored).
        #[clap(long)]
        image: ImageRef,
    },
    /// Remove a tag (removing an unknown tag is success).
    Rm {
        /// Image and tag to remove, `path:tag`.
        #[clap(long)]
        image: ImageRef,
    },
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum RawOpt {
    /// Append an existing uncompressed tar file as a layer.
    AddLayer {
        /// Image to modify, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Storage compression for the new layer.
        #[clap(long, value_enum, default_value = "none")]
        compress: CompressArg,
        #[clap(flatten)]
        history: HistoryFlags,
        /// The tar file to append.
        layer: Utf8PathBuf,
    },
    /// Extract only the rootfs, with no bundle metadata.
    Unpack {
        /// Source image, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Keep symlinks to directories when layers carry directories of
        /// the same name.
        #[clap(long)]
        keep_dirlinks: bool,
        #[clap(flatten)]
        map: MapFlags,
        /// Directory to extract into (overwritten if present).
        rootfs: Utf8PathBuf,
    },
    /// Generate an OCI runtime spec from an image configuration.
    RuntimeConfig {
        /// Source image, `path[:tag]`.
        #[clap(long)]
        image: ImageRef,
        /// Rootfs used to resolve user and group names.
        #[clap(long)]
        rootfs: Option<Utf8PathBuf>,
        #[clap(flatten)]
        map: MapFlags,
        /// Where to write the runtime spec.
        output: Utf8PathBuf,
    },
}

fn media_type_from_str(s: &str) -> MediaType {
    match s {
        "application/vnd.oci.image.manifest.v1+json" => MediaType::ImageManifest,
        "application/vnd.oci.image.index.v1+json" => MediaType::ImageIndex,
        "application/vnd.oci.image.config.v1+json" => MediaType::ImageConfig,
        "application/vnd.oci.image.layer.v1.tar" => MediaType::ImageLayer,
        "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::ImageLayerGzip,
        "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::ImageLayerZstd,
        other => MediaType::Other(other.to_string()),
    }
}

/// Whether an error chain bottoms out in a permission failure (used to
/// suggest `--rootless`).
pub fn error_is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::PermissionDenied;
        }
        if let Some(errno) = cause.downcast_ref::<rustix::io::Errno>() {
            return *errno == rustix::io::Errno::PERM || *errno == rustix::io::Errno::ACCESS;
        }
        false
    })
}

/// Parse arguments and run the chosen command.
pub fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let level = match (cli.log, cli.verbose) {
        (Some(level), _) => Some(level.as_filter()),
        (None, true) => Some("info"),
        (None, false) => None,
    };
    umoci_utils::initialize_tracing(level);
    run(cli.command)
}

fn run(opt: Opt) -> Result<()> {
    let cancel = CancellationToken::new();
    match opt {
        Opt::Init { layout } => CasDir::create(&layout),
        Opt::New { image } => {
            let engine = Engine::open_rw(&image.layout)?;
            crate::image::new_image(&engine, &image.tag, &cancel)?;
            Ok(())
        }
        Opt::Unpack {
            image,
            keep_dirlinks,
            map,
            bundle,
        } => {
            let engine = Engine::open(&image.layout)?;
            let opts = UnpackOptions {
                map: map.to_map_options(),
                keep_dirlinks,
                cancel,
                ..Default::default()
            };
            crate::unpack::unpack(&engine, &image.tag, &bundle, &opts)
        }
        Opt::Repack {
            image,
            mask_path,
            no_mask_volumes,
            refresh_bundle,
            compress,
            no_history,
            history,
            bundle,
        } => {
            let engine = Engine::open_rw(&image.layout)?;
            let history = if no_history {
                None
            } else {
                Some(history.to_history("umoci repack")?)
            };
            crate::repack::repack(
                &engine,
                &image.tag,
                &bundle,
                RepackOptions {
                    history,
                    mask_paths: mask_path,
                    no_mask_volumes,
                    refresh_bundle,
                    compression: compress.resolve(),
                    cancel,
                },
            )
        }
        Opt::Config {
            image,
            tag,
            config,
            clear,
            created,
            author,
            architecture,
            os,
            manifest_annotation,
            history,
        } => config_cmd(ConfigCmd {
            image,
            tag,
            config,
            clear,
            created,
            author,
            architecture,
            os,
            manifest_annotation,
            history,
            cancel,
        }),
        Opt::Insert {
            image,
            opaque,
            whiteout,
            history,
            source,
            target,
        } => {
            let engine = Engine::open_rw(&image.layout)?;
            let path = engine.resolve_reference_unique(&image.tag)?;
            let mut mutator = Mutator::new(&engine, path)?;
            let compression = mutator
                .manifest()?
                .layers()
                .last()
                .and_then(|l| Compression::from_media_type(l.media_type()))
                .unwrap_or_default();
            let pack_opts = pack::PackOptions {
                epoch: timeutil::source_date_epoch()?,
                cancel: cancel.clone(),
                ..Default::default()
            };
            let history = Some(history.to_history("umoci insert")?);
            match whiteout {
                Some(target) => {
                    mutator.add_layer(compression, None, history, |w| {
                        pack::whiteout_layer(&target, w, &pack_opts)
                    })?;
                }
                None => {
                    let source = source.expect("clap enforces source");
                    let target = target.expect("clap enforces target");
                    mutator.add_layer(compression, None, history, |w| {
                        pack::insert_layer(&source, &target, opaque, w, &pack_opts)
                    })?;
                }
            }
            let new_path = mutator.commit(&cancel)?;
            engine.update_reference(&image.tag, new_path.root().clone())
        }
        Opt::Gc { layout } => {
            let engine = Engine::open_rw(&layout)?;
            let summary = engine.gc()?;
            println!("removed {} blobs", summary.removed.len());
            Ok(())
        }
        Opt::Stat { image, json } => {
            let engine = Engine::open(&image.layout)?;
            let stat = crate::image::stat(&engine, &image.tag)?;
            if json {
                serde_json::to_writer_pretty(std::io::stdout().lock(), &stat)?;
                println!();
            } else {
                let mut table = comfy_table::Table::new();
                table.set_header(vec!["LAYER", "SIZE", "MEDIA TYPE", "CREATED BY"]);
                for layer in &stat.layers {
                    table.add_row(vec![
                        layer.digest.clone(),
                        layer.size.to_string(),
                        layer.media_type.clone(),
                        layer
                            .history
                            .as_ref()
                            .and_then(|h| h.created_by().clone())
                            .unwrap_or_default(),
                    ]);
                }
                println!("{table}");
            }
            Ok(())
        }
        Opt::Tag(tag) => tag_cmd(tag),
        Opt::Raw(raw) => raw_cmd(raw, cancel),
    }
}

fn tag_cmd(opt: TagOpt) -> Result<()> {
    match opt {
        TagOpt::Add {
            image,
            tag,
            blob,
            media_type,
        } => {
            let engine = Engine::open_rw(&image.layout)?;
            let digest: crate::digest::Digest = blob.parse()?;
            let size = engine.cas().stat_blob(&digest)?;
            let descriptor = oci_spec::image::DescriptorBuilder::default()
                .media_type(media_type_from_str(&media_type))
                .digest(digest.to_string())
                .size(size as i64)
                .build()?;
            engine.update_reference(&tag, descriptor)
        }
        TagOpt::List { image } => {
            let engine = Engine::open(&image.layout)?;
            for (name, _) in engine.list_references()? {
                println!("{name}");
            }
            Ok(())
        }
        TagOpt::Rm { image } => {
            let engine = Engine::open_rw(&image.layout)?;
            engine.delete_reference(&image.tag)
        }
    }
}

fn raw_cmd(opt: RawOpt, cancel: CancellationToken) -> Result<()> {
    match opt {
        RawOpt::AddLayer {
            image,
            compress,
            history,
            layer,
        } => {
            let engine = Engine::open_rw(&image.layout)?;
            let mut f = std::fs::File::open(&layer).with_context(|| format!("opening {layer}"))?;
            // The input must be a plain tar stream; compression is a
            // storage concern.
            let mut magic = [0u8; 4];
            let n = f.read(&mut magic)?;
            if n >= 2 && magic[..2] == [0x1f, 0x8b] || n >= 4 && magic == [0x28, 0xb5, 0x2f, 0xfd]
            {
                bail!(Error::invalid(format!(
                    "{layer} is compressed; raw add-layer takes an uncompressed tar"
                )));
            }
            let reader = std::io::Cursor::new(magic)
                .take(n as u64)
                .chain(f);
            let path = engine.resolve_reference_unique(&image.tag)?;
            let mut mutator = Mutator::new(&engine, path)?;
            let history = Some(history.to_history("umoci raw add-layer")?);
            mutator.add_layer_from_reader(
                compress.resolve().unwrap_or(Compression::None),
                None,
                history,
                reader,
                &cancel,
            )?;
            let new_path = mutator.commit(&cancel)?;
            engine.update_reference(&image.tag, new_path.root().clone())
        }
        RawOpt::Unpack {
            image,
            keep_dirlinks,
            map,
            rootfs,
        } => {
            let engine = Engine::open(&image.layout)?;
            let path = engine.resolve_reference_unique(&image.tag)?;
            let opts = UnpackOptions {
                map: map.to_map_options(),
                keep_dirlinks,
                cancel,
                ..Default::default()
            };
            crate::unpack::unpack_rootfs(&engine, &path, &rootfs, &opts)?;
            Ok(())
        }
        RawOpt::RuntimeConfig {
            image,
            rootfs,
            map,
            output,
        } => {
            let engine = Engine::open(&image.layout)?;
            let path = engine.resolve_reference_unique(&image.tag)?;
            let manifest = engine.manifest(path.target())?;
            let config = engine.config(manifest.config())?;
            let spec = runtime::runtime_spec(&config, rootfs.as_deref(), &map.to_map_options())?;
            spec.save(output.as_std_path())
                .with_context(|| format!("writing runtime spec to {output}"))?;
            Ok(())
        }
    }
}

struct ConfigCmd {
    image: ImageRef,
    tag: Option<String>,
    config: ConfigFlags,
    clear: Vec<String>,
    created: Option<String>,
    author: Option<String>,
    architecture: Option<String>,
    os: Option<String>,
    manifest_annotation: Vec<String>,
    history: HistoryFlags,
    cancel: CancellationToken,
}

fn config_cmd(cmd: ConfigCmd) -> Result<()> {
    let engine = Engine::open_rw(&cmd.image.layout)?;
    let path = engine.resolve_reference_unique(&cmd.image.tag)?;
    let mut mutator = Mutator::new(&engine, path)?;

    let mut config = mutator.config()?;
    let mut meta = mutator.meta()?;
    let mut annotations = mutator.annotations()?;

    // Clears apply before the new values so `--clear config.env
    // --config.env A=b` leaves exactly one variable.
    for key in &cmd.clear {
        match key.as_str() {
            "config.user" => {
                config.set_user(None);
            }
            "config.exposedports" => {
                config.set_exposed_ports(None);
            }
            "config.env" => {
                config.set_env(None);
            }
            "config.entrypoint" => {
                config.set_entrypoint(None);
            }
            "config.cmd" => {
                config.set_cmd(None);
            }
            "config.volume" | "config.volumes" => {
                config.set_volumes(None);
            }
            "config.labels" => {
                config.set_labels(None);
            }
            "config.workingdir" => {
                config.set_working_dir(None);
            }
            "config.stopsignal" => {
                config.set_stop_signal(None);
            }
            "manifest.annotations" => annotations.clear(),
            other => bail!(Error::invalid(format!("unknown --clear key {other:?}"))),
        }
    }

    if let Some(user) = &cmd.config.user {
        config.set_user(Some(user.clone()));
    }
    if !cmd.config.exposed_ports.is_empty() {
        let mut ports = config.exposed_ports().clone().unwrap_or_default();
        for port in &cmd.config.exposed_ports {
            if !ports.contains(port) {
                ports.push(port.clone());
            }
        }
        config.set_exposed_ports(Some(ports));
    }
    if !cmd.config.env.is_empty() {
        let mut env = config.env().clone().unwrap_or_default();
        for var in &cmd.config.env {
            let (key, _) = parse_kv(var)?;
            let prefix = format!("{key}=");
            env.retain(|existing| !existing.starts_with(&prefix));
            env.push(var.clone());
        }
        config.set_env(Some(env));
    }
    if !cmd.config.entrypoint.is_empty() {
        config.set_entrypoint(Some(cmd.config.entrypoint.clone()));
    }
    if !cmd.config.cmd.is_empty() {
        config.set_cmd(Some(cmd.config.cmd.clone()));
    }
    if !cmd.config.volume.is_empty() {
        let mut volumes = config.volumes().clone().unwrap_or_default();
        for volume in &cmd.config.volume {
            if !volumes.contains(volume) {
                volumes.push(volume.clone());
            }
        }
        config.set_volumes(Some(volumes));
    }
    if !cmd.config.label.is_empty() {
        let mut labels: HashMap<String, String> = config.labels().clone().unwrap_or_default();
        for label in &cmd.config.label {
            let (k, v) = parse_kv(label)?;
            labels.insert(k, v);
        }
        config.set_labels(Some(labels));
    }
    if let Some(dir) = &cmd.config.working_dir {
        config.set_working_dir(Some(dir.clone()));
    }
    if let Some(signal) = &cmd.config.stop_signal {
        config.set_stop_signal(Some(signal.clone()));
    }

    meta.created = Some(match &cmd.created {
        Some(s) => timeutil::parse_rfc3339(s)?,
        None => timeutil::now()?,
    });
    if let Some(author) = &cmd.author {
        meta.author = Some(author.clone());
    }
    if let Some(architecture) = &cmd.architecture {
        meta.architecture = Arch::from(architecture.as_str());
    }
    if let Some(os) = &cmd.os {
        meta.os = Os::from(os.as_str());
    }
    for annotation in &cmd.manifest_annotation {
        let (k, v) = parse_kv(annotation)?;
        annotations.insert(k, v);
    }

    let history = cmd.history.to_history("umoci config")?;
    mutator.set(config, meta, Some(annotations), Some(history))?;
    let new_path = mutator.commit(&cmd.cancel)?;
    let dest_tag = cmd.tag.as_deref().unwrap_or(&cmd.image.tag);
    engine.update_reference(dest_tag, new_path.root().clone())
}
