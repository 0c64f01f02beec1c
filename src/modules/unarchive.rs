//! Unarchive module - extract an archive on the host
//!
//! Idempotency comes from the `creates` guard: when the guard path exists
//! the archive is not opened at all. Without a guard every run extracts and
//! reports a change.
//!
//! Extraction never writes straight into `dest`. The archive is unpacked
//! into a staging directory inside `dest`, its contents are copied over,
//! and the staging directory is removed whether or not the copy succeeded.
//!
//! ```yaml
//! - unarchive:
//!     src: /var/backups/app-20240115T000000.tar.gz
//!     dest: /srv/app
//!     creates: /srv/app/.restored
//! ```

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

fn extract_command(src: &str, stage: &str) -> String {
    let lower = src.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        format!("unzip -q -o {} -d {}", shell_quote(src), shell_quote(stage))
    } else {
        // tar detects gzip and bzip2 compression on its own
        format!("tar -xf {} -C {}", shell_quote(src), shell_quote(stage))
    }
}

/// Extract `src` into `dest` through a staging directory.
///
/// Returns `Ok(false)` without touching anything when `creates` already
/// exists.
pub(crate) async fn extract(
    context: &ModuleContext,
    src: &str,
    dest: &str,
    creates: Option<&str>,
) -> ModuleResult<bool> {
    if let Some(guard) = creates {
        if context.path_exists(guard).await? {
            debug!(host = %context.host, guard = %guard, "guard present, skipping extraction");
            return Ok(false);
        }
    }

    if !context.path_exists(src).await? {
        return Err(ModuleError::PreconditionFailed(format!(
            "archive '{}' does not exist",
            src
        )));
    }

    let dest_q = shell_quote(dest);
    context.run_checked(&format!("mkdir -p -- {}", dest_q)).await?;

    let stage = format!(
        "{}/.converge-staging-{}",
        dest.trim_end_matches('/'),
        uuid::Uuid::new_v4().simple()
    );
    let stage_q = shell_quote(&stage);

    let unpacked = async {
        context.run_checked(&format!("mkdir -p -- {}", stage_q)).await?;
        context.run_checked(&extract_command(src, &stage)).await?;
        context
            .run_checked(&format!("cp -a {}/. {}/", stage_q, dest_q))
            .await
    }
    .await;

    let cleanup = context.run(&format!("rm -rf -- {}", stage_q)).await;
    unpacked?;
    cleanup?;
    Ok(true)
}

/// Module for extracting archives
pub struct UnarchiveModule;

#[async_trait]
impl Module for UnarchiveModule {
    fn name(&self) -> &'static str {
        "unarchive"
    }

    fn description(&self) -> &'static str {
        "Extract an archive on the host, guarded by a creates path"
    }

    fn required_params(&self) -> &[&'static str] {
        &["src", "dest"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let src = params.get_string_required("src")?;
        let dest = params.get_string_required("dest")?;
        let creates = params.get_string("creates")?;

        let output = if extract(context, &src, &dest, creates.as_deref()).await? {
            ModuleOutput::changed(format!("Extracted '{}' into '{}'", src, dest))
        } else {
            ModuleOutput::ok(format!(
                "Skipped extraction, '{}' exists",
                creates.as_deref().unwrap_or_default()
            ))
        };
        Ok(output
            .with_data("src", json!(src))
            .with_data("dest", json!(dest)))
    }
}
