//! End-to-end tests driving the real command surface in-process.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use umoci_lib::casext::Engine;
use umoci_lib::digest::Digest;

fn umoci(args: &[&str]) -> Result<()> {
    let argv = std::iter::once("umoci").chain(args.iter().copied());
    umoci_lib::cli::run_from_iter(argv)
}

struct Fixture {
    _td: tempfile::TempDir,
    dir: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(td.path().to_owned()).unwrap();
        Self { _td: td, dir }
    }

    fn path(&self, name: &str) -> Utf8PathBuf {
        self.dir.join(name)
    }

    fn image(&self) -> String {
        self.path("image").to_string()
    }

    fn image_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.image(), tag)
    }
}

#[test]
fn test_init_new_unpack_empty() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    // init refuses to clobber
    assert!(umoci(&["init", "--layout", &fx.image()]).is_err());
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    let bundle = fx.path("bundle");
    umoci(&[
        "unpack",
        "--image",
        &fx.image_tag("v1"),
        "--rootless",
        bundle.as_str(),
    ])?;

    let rootfs = bundle.join("rootfs");
    assert!(rootfs.is_dir());
    assert_eq!(std::fs::read_dir(&rootfs)?.count(), 0);
    assert!(bundle.join("umoci.json").is_file());
    let mtree_count = std::fs::read_dir(&bundle)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".mtree"))
        .count();
    assert_eq!(mtree_count, 1);
    Ok(())
}

#[test]
fn test_insert_modify_repack_cycle() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    // Seed content through insert.
    let payload = fx.path("payload");
    std::fs::create_dir_all(&payload)?;
    std::fs::write(payload.join("hostname"), b"darkstar\n")?;
    std::fs::write(payload.join("motd"), b"welcome\n")?;
    umoci(&[
        "insert",
        "--image",
        &fx.image_tag("v1"),
        payload.as_str(),
        "/etc",
    ])?;

    let bundle = fx.path("bundle");
    umoci(&[
        "unpack",
        "--image",
        &fx.image_tag("v1"),
        "--rootless",
        bundle.as_str(),
    ])?;
    assert_eq!(
        std::fs::read(bundle.join("rootfs/etc/hostname"))?,
        b"darkstar\n"
    );

    // Edit the rootfs with ordinary tools, repack as v2.
    std::fs::write(bundle.join("rootfs/etc/hostname"), b"lighstar\n")?;
    umoci(&[
        "repack",
        "--image",
        &fx.image_tag("v2"),
        bundle.as_str(),
    ])?;

    let out = fx.path("out");
    umoci(&[
        "unpack",
        "--image",
        &fx.image_tag("v2"),
        "--rootless",
        out.as_str(),
    ])?;
    assert_eq!(
        std::fs::read(out.join("rootfs/etc/hostname"))?,
        b"lighstar\n"
    );
    assert_eq!(std::fs::read(out.join("rootfs/etc/motd"))?, b"welcome\n");

    // Diff-IDs in the config match the uncompressed layer hashes.
    let engine = Engine::open(Utf8Path::new(&fx.image()))?;
    let path = engine.resolve_reference_unique("v2")?;
    let manifest = engine.manifest(path.target())?;
    let config = engine.config(manifest.config())?;
    assert_eq!(manifest.layers().len(), config.rootfs().diff_ids().len());
    for (layer, diff_id) in manifest.layers().iter().zip(config.rootfs().diff_ids()) {
        let blob = engine.verified_reader(layer)?;
        let mut uncompressed = Vec::new();
        std::io::Read::read_to_end(
            &mut umoci_lib::layer::decompress(blob)?,
            &mut uncompressed,
        )?;
        assert_eq!(&Digest::sha256_of(&uncompressed)?.to_string(), diff_id);
    }
    Ok(())
}

#[test]
fn test_config_edits() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;
    umoci(&[
        "config",
        "--image",
        &fx.image_tag("v1"),
        "--config.env",
        "PATH=/bin",
        "--config.cmd",
        "/bin/sh",
        "--author",
        "Aleksa Sarai <cyphar@cyphar.com>",
        "--tag",
        "v2",
    ])?;
    umoci(&[
        "config",
        "--image",
        &fx.image_tag("v2"),
        "--clear",
        "config.cmd",
    ])?;

    let engine = Engine::open(Utf8Path::new(&fx.image()))?;
    let path = engine.resolve_reference_unique("v2")?;
    let manifest = engine.manifest(path.target())?;
    let config = engine.config(manifest.config())?;
    let app = config.config().as_ref().unwrap();
    assert_eq!(app.env().as_ref().unwrap(), &vec!["PATH=/bin".to_string()]);
    assert!(app.cmd().as_ref().map(|c| c.is_empty()).unwrap_or(true));
    assert_eq!(
        config.author().as_deref(),
        Some("Aleksa Sarai <cyphar@cyphar.com>")
    );
    // Both config operations recorded empty-layer history.
    assert_eq!(config.history().len(), 2);
    assert!(config.history().iter().all(|h| h.empty_layer() == Some(true)));
    // v1 still resolves to the original image.
    let v1 = engine.resolve_reference_unique("v1")?;
    assert_ne!(v1.target().digest(), path.target().digest());
    Ok(())
}

#[test]
fn test_gc_removes_unreferenced() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    // Drop an unreferenced blob directly into the store.
    let junk = b"not referenced by anything";
    let digest = Digest::sha256_of(junk)?;
    let junk_path = fx
        .path("image")
        .join(format!("blobs/sha256/{}", digest.hex()));
    std::fs::write(&junk_path, junk)?;

    umoci(&["gc", "--layout", &fx.image()])?;
    assert!(!junk_path.exists());

    // Everything reachable from the reference survived.
    let engine = Engine::open(Utf8Path::new(&fx.image()))?;
    let path = engine.resolve_reference_unique("v1")?;
    engine.walk(path.target(), &mut |_| Ok(()))?;
    Ok(())
}

#[test]
fn test_tag_add_list_rm() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    let engine = Engine::open(Utf8Path::new(&fx.image()))?;
    let manifest_digest = engine
        .resolve_reference_unique("v1")?
        .target()
        .digest()
        .clone();
    drop(engine);

    umoci(&[
        "tag",
        "add",
        "--image",
        &fx.image(),
        "--tag",
        "extra",
        "--blob",
        &manifest_digest,
    ])?;
    let engine = Engine::open(Utf8Path::new(&fx.image()))?;
    let names: Vec<_> = engine
        .list_references()?
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert!(names.contains(&"v1".to_string()));
    assert!(names.contains(&"extra".to_string()));
    drop(engine);

    umoci(&["tag", "rm", "--image", &fx.image_tag("extra")])?;
    // Removing again is still success, and resolution returns nothing.
    umoci(&["tag", "rm", "--image", &fx.image_tag("extra")])?;
    let engine = Engine::open(Utf8Path::new(&fx.image()))?;
    assert!(engine.resolve_reference("extra")?.is_empty());
    assert_eq!(engine.resolve_reference_unique("v1")?.target().digest(), &manifest_digest);
    Ok(())
}

#[test]
fn test_raw_add_layer_and_runtime_config() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    // Build a plain tar on disk.
    let tar_path = fx.path("layer.tar");
    let mut builder = tar::Builder::new(std::fs::File::create(&tar_path)?);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(5);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, "hello", &b"world"[..])?;
    builder.into_inner()?;

    umoci(&[
        "raw",
        "add-layer",
        "--image",
        &fx.image_tag("v1"),
        tar_path.as_str(),
    ])?;

    let rootfs = fx.path("rootfs");
    umoci(&[
        "raw",
        "unpack",
        "--image",
        &fx.image_tag("v1"),
        "--rootless",
        rootfs.as_str(),
    ])?;
    assert_eq!(std::fs::read(rootfs.join("hello"))?, b"world");
    // raw unpack writes no bundle metadata
    assert!(!rootfs.join("umoci.json").exists());

    let spec_path = fx.path("config.json");
    umoci(&[
        "raw",
        "runtime-config",
        "--image",
        &fx.image_tag("v1"),
        "--rootless",
        spec_path.as_str(),
    ])?;
    let spec: serde_json::Value = serde_json::from_reader(std::fs::File::open(&spec_path)?)?;
    assert_eq!(spec["root"]["path"], "rootfs");
    Ok(())
}

#[test]
fn test_insert_whiteout() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    let payload = fx.path("payload");
    std::fs::create_dir_all(&payload)?;
    std::fs::write(payload.join("doomed"), b"bye")?;
    std::fs::write(payload.join("kept"), b"hi")?;
    umoci(&[
        "insert",
        "--image",
        &fx.image_tag("v1"),
        payload.as_str(),
        "/data",
    ])?;
    umoci(&[
        "insert",
        "--image",
        &fx.image_tag("v1"),
        "--whiteout",
        "/data/doomed",
    ])?;

    let bundle = fx.path("bundle");
    umoci(&[
        "unpack",
        "--image",
        &fx.image_tag("v1"),
        "--rootless",
        bundle.as_str(),
    ])?;
    assert!(!bundle.join("rootfs/data/doomed").exists());
    assert_eq!(std::fs::read(bundle.join("rootfs/data/kept"))?, b"hi");
    Ok(())
}

#[test]
fn test_ambiguous_reference_is_refused() -> Result<()> {
    let fx = Fixture::new();
    umoci(&["init", "--layout", &fx.image()])?;
    umoci(&["new", "--image", &fx.image_tag("v1")])?;

    // Forge a duplicate entry for the same name.
    let index_path = fx.path("image").join("index.json");
    let mut index: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(&index_path)?)?;
    let manifests = index["manifests"].as_array_mut().unwrap();
    let dup = manifests[0].clone();
    manifests.push(dup);
    serde_json::to_writer(std::fs::File::create(&index_path)?, &index)?;

    let bundle = fx.path("bundle");
    assert!(umoci(&[
        "unpack",
        "--image",
        &fx.image_tag("v1"),
        "--rootless",
        bundle.as_str(),
    ])
    .is_err());
    Ok(())
}
