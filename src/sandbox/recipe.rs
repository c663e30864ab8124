//! Language runner registry.
//!
//! Maps a language tag to an immutable [`Recipe`] describing how to write the
//! submission to disk, optionally compile it, and run it. Recipes are plain
//! data with small function fields; there is no runner hierarchy. All argv
//! and file names are relative to the scratch directory, which both backends
//! use as the working directory, so the same recipe drives host processes and
//! containers.

use super::types::SandboxError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// How a compiled language is built.
#[derive(Clone, Copy)]
pub struct CompileSpec {
    /// Candidate toolchains in fallback order; the first one present wins
    pub tools: &'static [&'static str],
    /// Artifact file name produced from the source name
    pub artifact: fn(&str) -> String,
    /// Build argv from (tool, source, artifact)
    pub argv: fn(&str, &str, &str) -> Vec<String>,
}

/// An immutable, process-wide description of one supported language.
#[derive(Clone, Copy)]
pub struct Recipe {
    /// Canonical language tag
    pub language: &'static str,
    /// Accepted file suffixes, without the dot
    pub extensions: &'static [&'static str],
    /// Canonical source file name (overridden by `source_name`)
    pub source_file: &'static str,
    /// Container image used by the container backend
    pub image: &'static str,
    /// Interpreter or launcher the run step needs on the host, if any
    pub runtime: Option<&'static str>,
    /// Prelude injection for submissions lacking the language's shell
    prepare: fn(&str) -> String,
    /// Source file name override (Java derives it from the class name)
    source_name: Option<fn(&str) -> String>,
    /// Compile step, when the language requires one
    pub compile: Option<CompileSpec>,
    /// Build the run argv from (source name, artifact name)
    run: fn(&str, Option<&str>) -> Vec<String>,
}

impl Recipe {
    /// Apply the documented prelude and return the prepared source text.
    pub fn prepare_source(&self, submitted: &str) -> String {
        (self.prepare)(submitted)
    }

    /// File name the prepared source must be written to.
    pub fn source_name(&self, prepared: &str) -> String {
        match self.source_name {
            Some(f) => f(prepared),
            None => self.source_file.to_string(),
        }
    }

    /// Artifact file name, for compiled languages.
    pub fn artifact_name(&self, source_name: &str) -> Option<String> {
        self.compile.map(|c| (c.artifact)(source_name))
    }

    /// Compile argv for a chosen toolchain, relative to the scratch dir.
    pub fn compile_argv(&self, tool: &str, source_name: &str, artifact: &str) -> Option<Vec<String>> {
        self.compile.map(|c| (c.argv)(tool, source_name, artifact))
    }

    /// Run argv, relative to the scratch dir.
    pub fn run_argv(&self, source_name: &str, artifact: Option<&str>) -> Vec<String> {
        (self.run)(source_name, artifact)
    }

    /// Locate the first available compiler on the host, in fallback order.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotSupported`] naming every candidate when
    /// none is installed.
    pub fn resolve_host_compiler(&self) -> Result<Option<String>, SandboxError> {
        let Some(compile) = self.compile else {
            return Ok(None);
        };
        for tool in compile.tools {
            if which::which(tool).is_ok() {
                debug!(language = self.language, tool, "resolved host compiler");
                return Ok(Some((*tool).to_string()));
            }
        }
        Err(SandboxError::NotSupported(format!(
            "no {} compiler found on host (tried: {})",
            self.language,
            compile.tools.join(", ")
        )))
    }

    /// Verify the host has the interpreter/launcher the run step needs.
    pub fn ensure_host_runtime(&self) -> Result<(), SandboxError> {
        if let Some(runtime) = self.runtime {
            which::which(runtime).map_err(|_| {
                SandboxError::NotSupported(format!(
                    "{} runtime '{}' not found on host",
                    self.language, runtime
                ))
            })?;
        }
        Ok(())
    }

    /// Toolchain name the container backend invokes (images always carry the
    /// primary toolchain).
    pub fn default_compiler(&self) -> Option<&'static str> {
        self.compile.map(|c| c.tools[0])
    }
}

fn identity(source: &str) -> String {
    source.to_string()
}

fn prepare_go(source: &str) -> String {
    let has_package = source
        .lines()
        .any(|line| line.trim_start().starts_with("package "));
    if has_package {
        source.to_string()
    } else {
        format!("package main\n\n{source}")
    }
}

fn prepare_rust(source: &str) -> String {
    if source.contains("fn main") {
        source.to_string()
    } else {
        format!("fn main() {{\n{source}\n}}\n")
    }
}

fn prepare_c(source: &str) -> String {
    if source.contains("int main") {
        source.to_string()
    } else {
        format!("#include <stdio.h>\n#include <stdlib.h>\n\nint main(void) {{\n{source}\nreturn 0;\n}}\n")
    }
}

fn prepare_cpp(source: &str) -> String {
    if source.contains("int main") {
        source.to_string()
    } else {
        format!("#include <iostream>\n\nint main() {{\n{source}\nreturn 0;\n}}\n")
    }
}

fn prepare_java(source: &str) -> String {
    if java_class_regex().is_match(source) {
        source.to_string()
    } else {
        format!(
            "public class Main {{\n    public static void main(String[] args) {{\n{source}\n    }}\n}}\n"
        )
    }
}

fn prepare_php(source: &str) -> String {
    if source.trim_start().starts_with("<?") {
        source.to_string()
    } else {
        format!("<?php\n{source}")
    }
}

fn java_class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"public\s+class\s+(\w+)").expect("valid regex"))
}

/// Java names the source file after the public class.
fn java_source_name(prepared: &str) -> String {
    let class = java_class_regex()
        .captures(prepared)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("Main");
    format!("{class}.java")
}

fn artifact_main(_source: &str) -> String {
    "main".to_string()
}

fn artifact_main_js(_source: &str) -> String {
    "main.js".to_string()
}

fn artifact_class(source: &str) -> String {
    format!("{}.class", source.trim_end_matches(".java"))
}

fn compile_c(tool: &str, source: &str, artifact: &str) -> Vec<String> {
    vec![
        tool.to_string(),
        source.to_string(),
        "-O2".to_string(),
        "-std=c11".to_string(),
        "-o".to_string(),
        artifact.to_string(),
    ]
}

fn compile_cpp(tool: &str, source: &str, artifact: &str) -> Vec<String> {
    vec![
        tool.to_string(),
        source.to_string(),
        "-O2".to_string(),
        "-std=c++17".to_string(),
        "-o".to_string(),
        artifact.to_string(),
    ]
}

fn compile_go(tool: &str, source: &str, artifact: &str) -> Vec<String> {
    vec![
        tool.to_string(),
        "build".to_string(),
        "-o".to_string(),
        artifact.to_string(),
        source.to_string(),
    ]
}

fn compile_rust(tool: &str, source: &str, artifact: &str) -> Vec<String> {
    vec![
        tool.to_string(),
        "-O".to_string(),
        "--edition=2021".to_string(),
        "-o".to_string(),
        artifact.to_string(),
        source.to_string(),
    ]
}

fn compile_java(tool: &str, source: &str, _artifact: &str) -> Vec<String> {
    vec![tool.to_string(), source.to_string()]
}

fn compile_typescript(tool: &str, source: &str, _artifact: &str) -> Vec<String> {
    vec![
        tool.to_string(),
        "--target".to_string(),
        "ES2020".to_string(),
        "--module".to_string(),
        "commonjs".to_string(),
        source.to_string(),
    ]
}

fn run_node(source: &str, _artifact: Option<&str>) -> Vec<String> {
    vec!["node".to_string(), source.to_string()]
}

fn run_node_artifact(_source: &str, artifact: Option<&str>) -> Vec<String> {
    vec!["node".to_string(), artifact.unwrap_or("main.js").to_string()]
}

fn run_python(source: &str, _artifact: Option<&str>) -> Vec<String> {
    vec!["python3".to_string(), source.to_string()]
}

fn run_ruby(source: &str, _artifact: Option<&str>) -> Vec<String> {
    vec!["ruby".to_string(), source.to_string()]
}

fn run_php(source: &str, _artifact: Option<&str>) -> Vec<String> {
    vec!["php".to_string(), source.to_string()]
}

fn run_binary(_source: &str, artifact: Option<&str>) -> Vec<String> {
    vec![format!("./{}", artifact.unwrap_or("main"))]
}

/// Java runs the class named by the source file, from the scratch dir.
fn run_java(source: &str, _artifact: Option<&str>) -> Vec<String> {
    let class = source.trim_end_matches(".java");
    vec![
        "java".to_string(),
        "-cp".to_string(),
        ".".to_string(),
        class.to_string(),
    ]
}

const RECIPES: &[Recipe] = &[
    Recipe {
        language: "javascript",
        extensions: &["js", "mjs"],
        source_file: "main.js",
        image: "node:20-alpine",
        runtime: Some("node"),
        prepare: identity,
        source_name: None,
        compile: None,
        run: run_node,
    },
    Recipe {
        language: "typescript",
        extensions: &["ts"],
        source_file: "main.ts",
        image: "node:20-alpine",
        runtime: Some("node"),
        prepare: identity,
        source_name: None,
        compile: Some(CompileSpec {
            tools: &["tsc"],
            artifact: artifact_main_js,
            argv: compile_typescript,
        }),
        run: run_node_artifact,
    },
    Recipe {
        language: "python",
        extensions: &["py"],
        source_file: "main.py",
        image: "python:3.12-alpine",
        runtime: Some("python3"),
        prepare: identity,
        source_name: None,
        compile: None,
        run: run_python,
    },
    Recipe {
        language: "go",
        extensions: &["go"],
        source_file: "main.go",
        image: "golang:1.22-alpine",
        runtime: None,
        prepare: prepare_go,
        source_name: None,
        compile: Some(CompileSpec {
            tools: &["go"],
            artifact: artifact_main,
            argv: compile_go,
        }),
        run: run_binary,
    },
    Recipe {
        language: "rust",
        extensions: &["rs"],
        source_file: "main.rs",
        image: "rust:1.79-slim",
        runtime: None,
        prepare: prepare_rust,
        source_name: None,
        compile: Some(CompileSpec {
            tools: &["rustc"],
            artifact: artifact_main,
            argv: compile_rust,
        }),
        run: run_binary,
    },
    Recipe {
        language: "c",
        extensions: &["c"],
        source_file: "main.c",
        image: "gcc:13",
        runtime: None,
        prepare: prepare_c,
        source_name: None,
        compile: Some(CompileSpec {
            tools: &["cc", "gcc", "clang"],
            artifact: artifact_main,
            argv: compile_c,
        }),
        run: run_binary,
    },
    Recipe {
        language: "cpp",
        extensions: &["cpp", "cc", "cxx"],
        source_file: "main.cpp",
        image: "gcc:13",
        runtime: None,
        prepare: prepare_cpp,
        source_name: None,
        compile: Some(CompileSpec {
            tools: &["c++", "g++", "clang++"],
            artifact: artifact_main,
            argv: compile_cpp,
        }),
        run: run_binary,
    },
    Recipe {
        language: "java",
        extensions: &["java"],
        source_file: "Main.java",
        image: "eclipse-temurin:21",
        runtime: Some("java"),
        prepare: prepare_java,
        source_name: Some(java_source_name),
        compile: Some(CompileSpec {
            tools: &["javac"],
            artifact: artifact_class,
            argv: compile_java,
        }),
        run: run_java,
    },
    Recipe {
        language: "ruby",
        extensions: &["rb"],
        source_file: "main.rb",
        image: "ruby:3.3-alpine",
        runtime: Some("ruby"),
        prepare: identity,
        source_name: None,
        compile: None,
        run: run_ruby,
    },
    Recipe {
        language: "php",
        extensions: &["php"],
        source_file: "main.php",
        image: "php:8.3-cli-alpine",
        runtime: Some("php"),
        prepare: prepare_php,
        source_name: None,
        compile: None,
        run: run_php,
    },
];

const ALIASES: &[(&str, &str)] = &[
    ("js", "javascript"),
    ("node", "javascript"),
    ("ts", "typescript"),
    ("py", "python"),
    ("python3", "python"),
    ("golang", "go"),
    ("rs", "rust"),
    ("c++", "cpp"),
    ("cxx", "cpp"),
    ("rb", "ruby"),
];

/// Resolves language tags and file extensions to recipes.
pub struct RunnerRegistry {
    recipes: HashMap<&'static str, &'static Recipe>,
    aliases: HashMap<&'static str, &'static str>,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        let recipes = RECIPES.iter().map(|r| (r.language, r)).collect();
        let aliases = ALIASES.iter().copied().collect();
        Self { recipes, aliases }
    }

    /// Resolve a canonical name or alias to its recipe.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotSupported`] for unknown tags.
    pub fn resolve(&self, language: &str) -> Result<&'static Recipe, SandboxError> {
        let tag = language.trim().to_lowercase();
        let canonical = self.aliases.get(tag.as_str()).copied().unwrap_or(tag.as_str());
        self.recipes.get(canonical).copied().ok_or_else(|| {
            SandboxError::NotSupported(format!("language '{language}' is not supported"))
        })
    }

    /// Resolve a file extension (without the dot) to its recipe.
    pub fn resolve_extension(&self, extension: &str) -> Option<&'static Recipe> {
        let ext = extension.trim_start_matches('.').to_lowercase();
        self.recipes
            .values()
            .find(|r| r.extensions.contains(&ext.as_str()))
            .copied()
    }

    /// Canonical names of every supported language, sorted.
    pub fn languages(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.recipes.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
