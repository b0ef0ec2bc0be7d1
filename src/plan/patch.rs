// Stage 9: settle the style of every pending diff and compute patches.
//
// Diffs whose source and target hash the same become moves. The rest are
// handed to bsdiff or imgdiff, which run as external programs on a bounded
// worker pool. Each worker stages its inputs in a private temp directory.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};
use rayon::prelude::*;

use super::BlockImageDiff;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::rangeset::RangeSet;
use crate::transfer::Style;

const BUF_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// External patch generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffTool {
    Bsdiff,
    Imgdiff,
}

impl DiffTool {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bsdiff => "bsdiff",
            Self::Imgdiff => "imgdiff",
        }
    }

    fn style(self) -> Style {
        match self {
            Self::Bsdiff => Style::Bsdiff,
            Self::Imgdiff => Style::Imgdiff,
        }
    }
}

impl fmt::Display for DiffTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps a diff tool to the executable that runs it.
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, tool: DiffTool) -> PathBuf;
}

impl<F> ToolResolver for F
where
    F: Fn(DiffTool) -> PathBuf + Send + Sync,
{
    fn resolve(&self, tool: DiffTool) -> PathBuf {
        self(tool)
    }
}

/// Runs tools by name, leaving the lookup to `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathResolver;

impl ToolResolver for PathResolver {
    fn resolve(&self, tool: DiffTool) -> PathBuf {
        PathBuf::from(tool.name())
    }
}

/// Archives that imgdiff understands, by target name extension.
fn imgdiff_candidate(tgt_name: &str) -> bool {
    let ext = tgt_name.rsplit('.').next().unwrap_or(tgt_name);
    ["apk", "jar", "zip"]
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
}

struct PatchTask {
    id: usize,
    tool: DiffTool,
    tgt_bytes: u64,
}

fn write_ranges(image: &dyn Image, ranges: &RangeSet, path: &Path) -> Result<()> {
    let mut out = BufWriter::with_capacity(BUF_SIZE, File::create(path)?);
    for chunk in image.read_range_set(ranges) {
        out.write_all(&chunk?)?;
    }
    out.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

impl BlockImageDiff<'_> {
    /// Resolve pending diffs, write new data in sequence order and patches
    /// in descending target size. Returns the byte counts of both blobs.
    pub(super) fn compute_patches<N, P>(&mut self, new_data: &mut N, patch_data: &mut P) -> Result<(u64, u64)>
    where
        N: Write + ?Sized,
        P: Write + ?Sized,
    {
        info!("preparing diff data");
        let block_size = self.tgt.block_size() as u64;
        let mut tasks = Vec::new();

        for pos in 0..self.sequence.len() {
            let id = self.sequence[pos];
            let xf = &self.transfers[id];
            if xf.style != Style::Diff {
                continue;
            }

            let style = if self.hash_src(&xf.src_ranges)? == self.hash_tgt(&xf.tgt_ranges)? {
                Style::Move
            } else {
                let tool = if !self.options.disable_imgdiff && xf.intact && imgdiff_candidate(&xf.tgt_name) {
                    DiffTool::Imgdiff
                } else {
                    DiffTool::Bsdiff
                };
                tasks.push(PatchTask {
                    id,
                    tool,
                    tgt_bytes: xf.tgt_ranges.size() * block_size,
                });
                tool.style()
            };
            debug!("{}: {style}", xf.tgt_name);
            self.transfers[id].style = style;
        }

        let mut new_bytes = 0u64;
        for &id in &self.sequence {
            let xf = &self.transfers[id];
            if xf.style != Style::New {
                continue;
            }
            for chunk in self.tgt.read_range_set(&xf.tgt_ranges) {
                let chunk = chunk?;
                new_data.write_all(&chunk)?;
                new_bytes += chunk.len() as u64;
            }
        }

        tasks.sort_by(|a, b| b.tgt_bytes.cmp(&a.tgt_bytes));
        let patches = self.run_patch_tasks(&tasks)?;

        let mut offset = 0u64;
        for (task, patch) in tasks.iter().zip(patches) {
            patch_data.write_all(&patch)?;
            let xf = &mut self.transfers[task.id];
            xf.patch_start = offset;
            xf.patch_len = patch.len() as u64;
            offset += xf.patch_len;
        }

        Ok((new_bytes, offset))
    }

    fn run_patch_tasks(&self, tasks: &[PatchTask]) -> Result<Vec<Vec<u8>>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        info!("computing {} patches ({} threads)", tasks.len(), self.threads);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("blockdelta-patch-{i}"))
            .build()?;
        pool.install(|| tasks.par_iter().map(|task| self.compute_patch(task)).collect())
    }

    fn compute_patch(&self, task: &PatchTask) -> Result<Vec<u8>> {
        let xf = &self.transfers[task.id];
        let dir = tempfile::Builder::new().prefix("blockdelta-").tempdir()?;
        let src_path = dir.path().join("src");
        let tgt_path = dir.path().join("tgt");
        let patch_path = dir.path().join("patch");

        write_ranges(self.src, &xf.src_ranges, &src_path)?;
        write_ranges(self.tgt, &xf.tgt_ranges, &tgt_path)?;

        let program = self.resolver.resolve(task.tool);
        let mut cmd = Command::new(&program);
        if task.tool == DiffTool::Imgdiff {
            cmd.arg("-z");
        }
        cmd.arg(&src_path).arg(&tgt_path).arg(&patch_path);

        let output = cmd.output().map_err(|source| Error::ToolLaunch {
            tool: task.tool,
            path: program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(Error::ToolFailed {
                tool: task.tool,
                target: xf.tgt_name.clone(),
                source_name: xf.src_name.clone().unwrap_or_default(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let patch = fs::read(&patch_path)?;
        let pct = if task.tgt_bytes > 0 {
            patch.len() as f64 * 100.0 / task.tgt_bytes as f64
        } else {
            0.0
        };
        let name = match xf.src_name.as_deref() {
            Some(src) if src != xf.tgt_name => format!("{} (from {src})", xf.tgt_name),
            _ => xf.tgt_name.clone(),
        };
        info!(
            "{:>10} {:>10} ({pct:6.2}%) {:>7} {name}",
            patch.len(),
            task.tgt_bytes,
            task.tool.name()
        );
        Ok(patch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
