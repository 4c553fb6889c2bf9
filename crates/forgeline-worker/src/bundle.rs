//! Local bundling toolchain and script test driver.
//!
//! `BundleToolchain` is the lane's built-in compile capability: it stages
//! the request's sources into the workspace, rejects any source carrying
//! a `#error` directive, and links the rest into a deterministic tar
//! bundle. The debug profile produces a library bundle, release an
//! executable bundle.
//!
//! `ScriptTestDriver` executes a driver script against the bundle. In
//! this miniature pipeline the driver reference carries its script
//! inline, same as sources carry their content inline:
//!
//! ```text
//! # one directive per line
//! assert-contains <file> <needle>
//! assert-entry-count <n>
//! ```
//!
//! A missed assertion is a FAIL verdict; a malformed script or an
//! unreadable bundle is an execution failure.

use std::io::Read;
use std::time::Instant;

use forgeline_protocol::{ArtifactKind, ArtifactRef, TestReport, Verdict};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::compile::{CompileCapability, CompileFailure, CompileInput, CompiledArtifact};
use crate::test::{ExecutionFailure, TestCapability, TestInput};
use crate::workspace::Workspace;

/// Directive marking a line as a deliberate compile error.
pub const ERROR_DIRECTIVE: &str = "#error";

/// Built-in compile capability: validate sources, pack them into a tar
/// bundle.
#[derive(Debug, Default, Clone)]
pub struct BundleToolchain;

impl BundleToolchain {
    pub fn new() -> Self {
        Self
    }

    /// Scan one source for error directives, returning diagnostics.
    fn check_source(source_name: &str, content: &str) -> Vec<String> {
        content
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                let trimmed = line.trim_start();
                trimmed.strip_prefix(ERROR_DIRECTIVE).map(|rest| {
                    format!("{}:{}: {}", source_name, idx + 1, rest.trim())
                })
            })
            .collect()
    }
}

impl CompileCapability for BundleToolchain {
    fn compile(
        &self,
        workspace: &Workspace,
        input: &CompileInput,
    ) -> Result<CompiledArtifact, CompileFailure> {
        let mut build_log = String::new();
        let mut diagnostics = Vec::new();

        // Stage and check each source in submission order.
        for source in &input.sources {
            workspace.write_file(&format!("src/{}", source.name), source.content.as_bytes())?;
            diagnostics.extend(Self::check_source(&source.name, &source.content));
            build_log.push_str(&format!(
                "compiling {} ({} bytes)\n",
                source.name,
                source.content.len()
            ));
        }

        if !diagnostics.is_empty() {
            for diag in &diagnostics {
                build_log.push_str(&format!("error: {}\n", diag));
            }
            return Err(CompileFailure::Toolchain(diagnostics.join("; ")));
        }

        // Link: deterministic tar of the staged sources. Fixed mtime and
        // mode so identical sources always produce identical bytes.
        let mut builder = tar::Builder::new(Vec::new());
        for source in &input.sources {
            let data = source.content.as_bytes();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("src/{}", source.name), data)
                .map_err(|e| CompileFailure::Infra(format!("bundle write failed: {}", e)))?;
        }

        let info = bundle_info(input);
        let mut header = tar::Header::new_gnu();
        header.set_size(info.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, "bundle-info.json", info.as_bytes())
            .map_err(|e| CompileFailure::Infra(format!("bundle write failed: {}", e)))?;

        let bytes = builder
            .into_inner()
            .map_err(|e| CompileFailure::Infra(format!("bundle finalize failed: {}", e)))?;

        let kind = kind_for_profile(&input.profile);
        build_log.push_str(&format!(
            "linked bundle ({} bytes, {})\n",
            bytes.len(),
            kind.as_str()
        ));
        debug!(request_id = %input.request_id, size = bytes.len(), "bundle linked");

        Ok(CompiledArtifact {
            bytes,
            kind,
            build_log,
        })
    }
}

/// Artifact kind decided by the configuration profile, mirroring the
/// debug-library / release-executable convention.
pub fn kind_for_profile(profile: &str) -> ArtifactKind {
    if profile == "release" {
        ArtifactKind::Executable
    } else {
        ArtifactKind::Library
    }
}

fn bundle_info(input: &CompileInput) -> String {
    let names: Vec<&str> = input.sources.iter().map(|s| s.name.as_str()).collect();
    let digests: Vec<String> = input
        .sources
        .iter()
        .map(|s| {
            let mut hasher = Sha256::new();
            hasher.update(s.content.as_bytes());
            hex::encode(hasher.finalize())
        })
        .collect();
    serde_json::json!({
        "profile": input.profile,
        "sources": names,
        "source_sha256": digests,
    })
    .to_string()
}

/// Built-in test capability: run an inline assertion script against the
/// unpacked bundle.
#[derive(Debug, Default, Clone)]
pub struct ScriptTestDriver;

impl ScriptTestDriver {
    pub fn new() -> Self {
        Self
    }
}

impl TestCapability for ScriptTestDriver {
    fn run(&self, workspace: &Workspace, input: &TestInput) -> Result<TestReport, ExecutionFailure> {
        let started = Instant::now();

        // Unpack the bundle into the test workspace.
        let mut archive = tar::Archive::new(input.artifact_bytes.as_slice());
        let mut entries = Vec::new();
        for entry in archive
            .entries()
            .map_err(|e| ExecutionFailure::Crashed(format!("unreadable bundle: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| ExecutionFailure::Crashed(format!("unreadable bundle: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| ExecutionFailure::Crashed(format!("unreadable bundle: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| ExecutionFailure::Crashed(format!("unreadable bundle: {}", e)))?;
            workspace.write_file(&path, content.as_bytes())?;
            entries.push((path, content));
        }

        // Source entries only; bundle-info.json is toolchain metadata.
        let source_count = entries.iter().filter(|(p, _)| p.starts_with("src/")).count();

        let mut output = String::new();
        let mut verdict = Verdict::Pass;

        for (idx, line) in input.test_driver.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, ' ');
            let directive = parts.next().unwrap_or_default();
            match directive {
                "assert-contains" => {
                    let (file, needle) = match (parts.next(), parts.next()) {
                        (Some(f), Some(n)) => (f, n),
                        _ => {
                            return Err(ExecutionFailure::BadDriver {
                                driver: input.test_driver.clone(),
                                reason: format!("line {}: assert-contains needs <file> <needle>", idx + 1),
                            })
                        }
                    };
                    let hit = entries
                        .iter()
                        .any(|(p, c)| p == &format!("src/{}", file) && c.contains(needle));
                    if hit {
                        output.push_str(&format!("ok - {} contains {:?}\n", file, needle));
                    } else {
                        output.push_str(&format!("not ok - {} contains {:?}\n", file, needle));
                        verdict = Verdict::Fail;
                    }
                }
                "assert-entry-count" => {
                    let expected: usize = parts
                        .next()
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| ExecutionFailure::BadDriver {
                            driver: input.test_driver.clone(),
                            reason: format!("line {}: assert-entry-count needs <n>", idx + 1),
                        })?;
                    if source_count == expected {
                        output.push_str(&format!("ok - bundle has {} entries\n", expected));
                    } else {
                        output.push_str(&format!(
                            "not ok - bundle has {} entries, expected {}\n",
                            source_count, expected
                        ));
                        verdict = Verdict::Fail;
                    }
                }
                other => {
                    return Err(ExecutionFailure::BadDriver {
                        driver: input.test_driver.clone(),
                        reason: format!("line {}: unknown directive {:?}", idx + 1, other),
                    })
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        Ok(TestReport::new(
            input.request_id.clone(),
            input.artifact.content_sha256.clone(),
            verdict,
            output,
            duration_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeline_protocol::{RequestId, SourceRef};

    use crate::workspace::WorkspaceRoot;

    fn input(sources: Vec<(&str, &str)>, profile: &str) -> CompileInput {
        CompileInput {
            request_id: RequestId::generate(),
            sources: sources
                .into_iter()
                .map(|(name, content)| SourceRef {
                    name: name.to_string(),
                    content: content.to_string(),
                })
                .collect(),
            profile: profile.to_string(),
        }
    }

    fn ws(root: &WorkspaceRoot, stage: &str) -> Workspace {
        root.scoped("req-test", stage).unwrap()
    }

    #[test]
    fn test_compile_produces_deterministic_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::new(tmp.path()).unwrap();
        let toolchain = BundleToolchain::new();

        let a = toolchain
            .compile(&ws(&root, "c1"), &input(vec![("a.src", "fn a()")], "debug"))
            .unwrap();
        let b = toolchain
            .compile(&ws(&root, "c2"), &input(vec![("a.src", "fn a()")], "debug"))
            .unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.kind, ArtifactKind::Library);
    }

    #[test]
    fn test_release_profile_builds_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::new(tmp.path()).unwrap();
        let artifact = BundleToolchain::new()
            .compile(&ws(&root, "compile"), &input(vec![("a.src", "fn a()")], "release"))
            .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Executable);
    }

    #[test]
    fn test_error_directive_fails_compile() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::new(tmp.path()).unwrap();
        let result = BundleToolchain::new().compile(
            &ws(&root, "compile"),
            &input(vec![("bad.src", "fn a()\n#error unexpected token")], "debug"),
        );
        match result {
            Err(CompileFailure::Toolchain(msg)) => {
                assert!(msg.contains("bad.src:2"), "diagnostic names file and line: {}", msg);
                assert!(msg.contains("unexpected token"));
            }
            other => panic!("expected toolchain failure, got {:?}", other.map(|a| a.kind)),
        }
    }

    #[test]
    fn test_build_log_lists_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::new(tmp.path()).unwrap();
        let artifact = BundleToolchain::new()
            .compile(
                &ws(&root, "compile"),
                &input(vec![("a.src", "fn a()"), ("b.src", "fn b()")], "debug"),
            )
            .unwrap();
        assert!(artifact.build_log.contains("compiling a.src"));
        assert!(artifact.build_log.contains("compiling b.src"));
        assert!(artifact.build_log.contains("linked bundle"));
    }

    fn run_driver(driver: &str, sources: Vec<(&str, &str)>) -> Result<TestReport, ExecutionFailure> {
        let tmp = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::new(tmp.path()).unwrap();
        let compile_input = input(sources, "debug");
        let request_id = compile_input.request_id.clone();
        let artifact = BundleToolchain::new()
            .compile(&ws(&root, "compile"), &compile_input)
            .unwrap();
        let artifact_ref =
            ArtifactRef::for_content(request_id.clone(), artifact.kind, &artifact.bytes);
        ScriptTestDriver::new().run(
            &ws(&root, "test"),
            &TestInput {
                request_id,
                artifact: artifact_ref,
                artifact_bytes: artifact.bytes,
                test_driver: driver.to_string(),
            },
        )
    }

    #[test]
    fn test_driver_pass() {
        let report = run_driver(
            "assert-contains a.src fn a\nassert-entry-count 1",
            vec![("a.src", "fn a()")],
        )
        .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert!(report.output.contains("ok - a.src"));
    }

    #[test]
    fn test_driver_failing_assertion_is_fail_verdict_not_error() {
        let report = run_driver("assert-contains a.src missing_symbol", vec![("a.src", "fn a()")])
            .unwrap();
        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.output.contains("not ok"));
    }

    #[test]
    fn test_driver_unknown_directive_is_execution_failure() {
        let result = run_driver("explode now", vec![("a.src", "fn a()")]);
        assert!(matches!(result, Err(ExecutionFailure::BadDriver { .. })));
    }

    #[test]
    fn test_driver_comments_and_blank_lines_ignored() {
        let report = run_driver("# a comment\n\nassert-entry-count 1", vec![("a.src", "fn a()")])
            .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
    }
}
