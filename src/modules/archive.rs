//! Archive module - pack a path on the host into an archive
//!
//! This module is not content-idempotent. When the destination is derived
//! from `dest_dir` and `prefix`, its name embeds the current UTC time as
//! `<prefix>-YYYYMMDDTHHMMSS.<ext>`, so every run produces a new archive and
//! reports a change. Only an already existing destination makes the module
//! report ok. Retention of old archives is the naming scheme's concern, not
//! this module's.
//!
//! The archive is written to a `.partial` sibling and moved into place, so
//! a failed run never leaves a truncated archive under the final name.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::backup::timestamped_name;
use crate::connection::shell_quote;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Gz,
    Tar,
    Bz2,
    Zip,
}

impl ArchiveFormat {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s {
            "gz" | "tgz" | "tar.gz" => Ok(ArchiveFormat::Gz),
            "tar" => Ok(ArchiveFormat::Tar),
            "bz2" | "tar.bz2" => Ok(ArchiveFormat::Bz2),
            "zip" => Ok(ArchiveFormat::Zip),
            other => Err(ModuleError::InvalidParameter(format!(
                "Invalid format '{}'. Valid formats: gz, tar, bz2, zip",
                other
            ))),
        }
    }

    /// File extension for generated names
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Gz => "tar.gz",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Bz2 => "tar.bz2",
            ArchiveFormat::Zip => "zip",
        }
    }

    fn command(&self, archive: &str, parent: &str, entry: &str) -> String {
        let (archive, parent, entry) = (shell_quote(archive), shell_quote(parent), shell_quote(entry));
        match self {
            ArchiveFormat::Gz => format!("tar -czf {} -C {} {}", archive, parent, entry),
            ArchiveFormat::Tar => format!("tar -cf {} -C {} {}", archive, parent, entry),
            ArchiveFormat::Bz2 => format!("tar -cjf {} -C {} {}", archive, parent, entry),
            ArchiveFormat::Zip => format!("cd {} && zip -q -r {} {}", parent, archive, entry),
        }
    }
}

fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (".".to_string(), trimmed.to_string()),
    }
}

/// Module for creating archives
pub struct ArchiveModule;

#[async_trait]
impl Module for ArchiveModule {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn description(&self) -> &'static str {
        "Create a tar or zip archive from a path on the host"
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(format) = params.get_string("format")? {
            ArchiveFormat::from_str(&format)?;
        }
        let has_dest = params.get_string("dest")?.is_some();
        let has_dir = params.get_string("dest_dir")?.is_some() && params.get_string("prefix")?.is_some();
        if !has_dest && !has_dir {
            return Err(ModuleError::MissingParameter(
                "dest, or dest_dir and prefix".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;
        let format = ArchiveFormat::from_str(
            params.get_string("format")?.as_deref().unwrap_or("gz"),
        )?;

        let dest = match params.get_string("dest")? {
            Some(dest) => dest,
            None => {
                let dir = params.get_string_required("dest_dir")?;
                let prefix = params.get_string_required("prefix")?;
                format!(
                    "{}/{}",
                    dir.trim_end_matches('/'),
                    timestamped_name(&prefix, Utc::now(), format.extension())
                )
            }
        };

        if !context.path_exists(&path).await? {
            return Err(ModuleError::PreconditionFailed(format!(
                "source '{}' does not exist",
                path
            )));
        }
        if context.path_exists(&dest).await? {
            return Ok(ModuleOutput::ok(format!("Archive '{}' already exists", dest))
                .with_data("dest", json!(dest)));
        }

        let partial = format!("{}.partial", dest);
        let (parent, entry) = split_path(&path);
        let built = context
            .run_checked(&format!(
                "{} && mv -f {} {}",
                format.command(&partial, &parent, &entry),
                shell_quote(&partial),
                shell_quote(&dest)
            ))
            .await;
        if let Err(e) = built {
            let _ = context.run(&format!("rm -f {}", shell_quote(&partial))).await;
            return Err(e);
        }

        Ok(ModuleOutput::changed(format!("Created archive '{}'", dest))
            .with_data("dest", json!(dest))
            .with_data("format", json!(format.extension())))
    }
}
