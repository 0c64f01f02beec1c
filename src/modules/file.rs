//! File module - manage file and directory state
//!
//! States: `file` (attributes of an existing file), `directory`, `absent`,
//! `link` and `touch`. Each reports a change only when the path's type or a
//! requested attribute differs.

use async_trait::async_trait;
use serde_json::json;

use super::{
    FileKind, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult,
    ParamExt, RemoteStat,
};
use crate::connection::shell_quote;

/// Requested ownership and permissions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Attributes {
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl Attributes {
    pub(crate) fn from_params(params: &ModuleParams) -> ModuleResult<Self> {
        Ok(Self {
            mode: params.get_mode("mode")?,
            owner: params.get_string("owner")?,
            group: params.get_string("group")?,
        })
    }

    fn is_empty(&self) -> bool {
        self.mode.is_none() && self.owner.is_none() && self.group.is_none()
    }
}

/// Bring `path` to the requested attributes; returns whether anything
/// changed.
pub(crate) async fn apply_attributes(
    context: &ModuleContext,
    path: &str,
    attrs: &Attributes,
    current: &RemoteStat,
) -> ModuleResult<bool> {
    let quoted = shell_quote(path);
    let mut changed = false;

    if let Some(mode) = attrs.mode {
        if current.mode != mode {
            context
                .run_checked(&format!("chmod {:o} {}", mode, quoted))
                .await?;
            changed = true;
        }
    }
    if let Some(owner) = &attrs.owner {
        if &current.owner != owner {
            context
                .run_checked(&format!("chown {} {}", shell_quote(owner), quoted))
                .await?;
            changed = true;
        }
    }
    if let Some(group) = &attrs.group {
        if &current.group != group {
            context
                .run_checked(&format!("chgrp {} {}", shell_quote(group), quoted))
                .await?;
            changed = true;
        }
    }
    Ok(changed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    File,
    Directory,
    Absent,
    Link,
    Touch,
}

impl FileState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s {
            "file" => Ok(FileState::File),
            "directory" => Ok(FileState::Directory),
            "absent" => Ok(FileState::Absent),
            "link" => Ok(FileState::Link),
            "touch" => Ok(FileState::Touch),
            other => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: file, directory, absent, link, touch",
                other
            ))),
        }
    }
}

/// Module for managing filesystem entries
pub struct FileModule;

impl FileModule {
    async fn converge_attributes(
        context: &ModuleContext,
        path: &str,
        attrs: &Attributes,
    ) -> ModuleResult<bool> {
        if attrs.is_empty() {
            return Ok(false);
        }
        let current = context.stat(path).await?.ok_or_else(|| {
            ModuleError::RemoteExecution {
                code: 1,
                message: format!("'{}' disappeared while setting attributes", path),
            }
        })?;
        apply_attributes(context, path, attrs, &current).await
    }
}

#[async_trait]
impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Manage files, directories, symlinks and their attributes"
    }

    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(state) = params.get_string("state")? {
            if FileState::from_str(&state)? == FileState::Link && params.get_string("src")?.is_none() {
                return Err(ModuleError::MissingParameter("src".to_string()));
            }
        }
        Attributes::from_params(params)?;
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;
        let attrs = Attributes::from_params(params)?;
        let current = context.stat(&path).await?;
        let quoted = shell_quote(&path);

        let state = match params.get_string("state")? {
            Some(state) => FileState::from_str(&state)?,
            None => match &current {
                Some(stat) if stat.kind == FileKind::Directory => FileState::Directory,
                _ => FileState::File,
            },
        };

        let mut changed = false;
        match state {
            FileState::Absent => {
                if current.is_some() {
                    context.run_checked(&format!("rm -rf -- {}", quoted)).await?;
                    changed = true;
                }
            }
            FileState::Directory => {
                match &current {
                    None => {
                        context.run_checked(&format!("mkdir -p -- {}", quoted)).await?;
                        changed = true;
                    }
                    Some(stat) if stat.kind != FileKind::Directory => {
                        return Err(ModuleError::PreconditionFailed(format!(
                            "'{}' exists and is not a directory",
                            path
                        )));
                    }
                    Some(_) => {}
                }
                changed |= Self::converge_attributes(context, &path, &attrs).await?;
            }
            FileState::File => {
                match &current {
                    None => {
                        return Err(ModuleError::PreconditionFailed(format!(
                            "file '{}' does not exist",
                            path
                        )))
                    }
                    Some(stat) if stat.kind == FileKind::Directory => {
                        return Err(ModuleError::PreconditionFailed(format!(
                            "'{}' is a directory",
                            path
                        )))
                    }
                    Some(stat) => changed |= apply_attributes(context, &path, &attrs, stat).await?,
                }
            }
            FileState::Touch => {
                if current.is_none() {
                    context.run_checked(&format!("touch -- {}", quoted)).await?;
                    changed = true;
                }
                changed |= Self::converge_attributes(context, &path, &attrs).await?;
            }
            FileState::Link => {
                let src = params.get_string_required("src")?;
                let up_to_date = match &current {
                    Some(stat) if stat.kind == FileKind::Link => {
                        let target = context.run_checked(&format!("readlink -- {}", quoted)).await?;
                        target.stdout.trim_end_matches('\n') == src
                    }
                    Some(stat) if stat.kind == FileKind::Directory => {
                        return Err(ModuleError::PreconditionFailed(format!(
                            "'{}' is a directory; refusing to replace it with a link",
                            path
                        )))
                    }
                    _ => false,
                };
                if !up_to_date {
                    context
                        .run_checked(&format!("ln -sfn -- {} {}", shell_quote(&src), quoted))
                        .await?;
                    changed = true;
                }
            }
        }

        let msg = if changed {
            format!("'{}' updated", path)
        } else {
            format!("'{}' already in desired state", path)
        };
        let output = if changed {
            ModuleOutput::changed(msg)
        } else {
            ModuleOutput::ok(msg)
        };
        Ok(output.with_data("path", json!(path)))
    }
}
