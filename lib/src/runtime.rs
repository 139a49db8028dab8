//! Translating an image configuration into an OCI runtime spec
//! (`raw runtime-config`).
//!
//! This is a pure data transform following the image-spec conversion
//! rules: verbatim fields map onto the process section, everything
//! without a runtime equivalent becomes an annotation.

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use oci_spec::image::ImageConfiguration;
use oci_spec::runtime::{
    LinuxBuilder, LinuxIdMappingBuilder, LinuxNamespaceBuilder, LinuxNamespaceType,
    ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};

use crate::layer::idmap::MapOptions;
use crate::Error;

/// Split a `user[:group]` string from `Config.User`.
fn split_user(user: &str) -> Result<(&str, Option<&str>)> {
    match user.split(':').collect::<Vec<_>>().as_slice() {
        [u] => Ok((u, None)),
        [u, g] => Ok((u, Some(g))),
        _ => Err(Error::invalid(format!("invalid Config.User {user:?}")).into()),
    }
}

// Resolve a user name (or numeric id) against the bundle's /etc/passwd,
// if one is available.
fn resolve_uid(user: &str, rootfs: Option<&Utf8Path>) -> Result<(u32, Option<u32>)> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok((uid, None));
    }
    let Some(rootfs) = rootfs else {
        bail!(Error::invalid(format!(
            "cannot resolve user name {user:?} without a rootfs"
        )));
    };
    let passwd = std::fs::read_to_string(rootfs.join("etc/passwd"))
        .with_context(|| format!("reading {rootfs}/etc/passwd"))?;
    for line in passwd.lines() {
        let fields: Vec<_> = line.split(':').collect();
        if fields.first() == Some(&user) && fields.len() >= 4 {
            let uid = fields[2].parse().context("parsing passwd uid")?;
            let gid = fields[3].parse().context("parsing passwd gid")?;
            return Ok((uid, Some(gid)));
        }
    }
    bail!(Error::not_found(format!("user {user:?} in {rootfs}/etc/passwd")))
}

fn resolve_gid(group: &str, rootfs: Option<&Utf8Path>) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    let Some(rootfs) = rootfs else {
        bail!(Error::invalid(format!(
            "cannot resolve group name {group:?} without a rootfs"
        )));
    };
    let groups = std::fs::read_to_string(rootfs.join("etc/group"))
        .with_context(|| format!("reading {rootfs}/etc/group"))?;
    for line in groups.lines() {
        let fields: Vec<_> = line.split(':').collect();
        if fields.first() == Some(&group) && fields.len() >= 3 {
            return Ok(fields[2].parse().context("parsing group gid")?);
        }
    }
    bail!(Error::not_found(format!("group {group:?} in {rootfs}/etc/group")))
}

/// Generate a runtime spec for `image_config`. `rootfs` (when given) is
/// used to resolve symbolic user/group names; `map` adds a user
/// namespace with the corresponding id mappings in rootless mode.
#[context("Generating runtime config")]
pub fn runtime_spec(
    image_config: &ImageConfiguration,
    rootfs: Option<&Utf8Path>,
    map: &MapOptions,
) -> Result<Spec> {
    let mut spec = SpecBuilder::default().build()?;
    let mut annotations = std::collections::HashMap::new();
    annotations.insert(
        "org.opencontainers.image.os".to_string(),
        image_config.os().to_string(),
    );
    annotations.insert(
        "org.opencontainers.image.architecture".to_string(),
        image_config.architecture().to_string(),
    );
    if let Some(author) = image_config.author() {
        annotations.insert("org.opencontainers.image.author".to_string(), author.clone());
    }
    if let Some(created) = image_config.created() {
        annotations.insert(
            "org.opencontainers.image.created".to_string(),
            created.clone(),
        );
    }

    let mut process = ProcessBuilder::default().build()?;
    process.set_cwd("/".into());
    if let Some(config) = image_config.config() {
        if let Some(dir) = config.working_dir() {
            if !dir.is_empty() {
                process.set_cwd(dir.into());
            }
        }
        let mut args = Vec::new();
        if let Some(entrypoint) = config.entrypoint() {
            args.extend(entrypoint.iter().cloned());
        }
        if let Some(cmd) = config.cmd() {
            args.extend(cmd.iter().cloned());
        }
        if !args.is_empty() {
            process.set_args(Some(args));
        }
        process.set_env(config.env().clone());
        if let Some(user) = config.user() {
            if !user.is_empty() {
                let (user, group) = split_user(user)?;
                let (uid, passwd_gid) = resolve_uid(user, rootfs)?;
                let gid = match group {
                    Some(g) => resolve_gid(g, rootfs)?,
                    None => passwd_gid.unwrap_or(0),
                };
                process.set_user(UserBuilder::default().uid(uid).gid(gid).build()?);
            }
        }
        if let Some(signal) = config.stop_signal() {
            annotations.insert(
                "org.opencontainers.image.stopSignal".to_string(),
                signal.clone(),
            );
        }
        // Labels win over the derived annotations.
        if let Some(labels) = config.labels() {
            annotations.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    spec.set_process(Some(process));
    spec.set_root(Some(
        RootBuilder::default()
            .path(crate::bundle::ROOTFS_NAME)
            .readonly(false)
            .build()?,
    ));
    spec.set_annotations(Some(annotations));

    if map.rootless {
        let uid = rustix::process::geteuid().as_raw();
        let gid = rustix::process::getegid().as_raw();
        let mut uid_mappings: Vec<_> = map.uid_mappings.clone();
        if uid_mappings.is_empty() {
            uid_mappings.push(format!("0:{uid}:1").parse()?);
        }
        let mut gid_mappings: Vec<_> = map.gid_mappings.clone();
        if gid_mappings.is_empty() {
            gid_mappings.push(format!("0:{gid}:1").parse()?);
        }
        let to_linux = |m: &crate::layer::idmap::IdMapping| {
            LinuxIdMappingBuilder::default()
                .container_id(m.container_id)
                .host_id(m.host_id)
                .size(m.size)
                .build()
        };
        let linux = LinuxBuilder::default()
            .namespaces(vec![
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::User)
                    .build()?,
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Mount)
                    .build()?,
            ])
            .uid_mappings(
                uid_mappings
                    .iter()
                    .map(to_linux)
                    .collect::<Result<Vec<_>, _>>()?,
            )
            .gid_mappings(
                gid_mappings
                    .iter()
                    .map(to_linux)
                    .collect::<Result<Vec<_>, _>>()?,
            )
            .build()?;
        spec.set_linux(Some(linux));
    }
    Ok(spec)
}
