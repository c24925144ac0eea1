use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

/// How one language is compiled and run. Commands are argument vectors with
/// `{source}`, `{binary}` and `{class}` placeholders; they are never re-parsed by a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: String,
    pub extension: String,
    #[serde(default = "default_stem")]
    pub source_stem: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    /// Cap the address space in the unprivileged sandbox. Runtimes that reserve large
    /// virtual ranges up front (JVM, Go, V8) get a data-segment cap instead.
    #[serde(default = "default_limit_address_space")]
    pub limit_address_space: bool,
}

fn default_stem() -> String {
    "main".to_string()
}

fn default_limit_address_space() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl LanguageProfile {
    pub fn source_name(&self) -> String {
        format!("{}.{}", self.source_stem, self.extension)
    }

    pub fn binary_name(&self) -> &str {
        &self.source_stem
    }

    fn placeholders(&self) -> [(&'static str, String); 3] {
        [
            ("source", self.source_name()),
            ("binary", self.binary_name().to_string()),
            ("class", self.source_stem.clone()),
        ]
    }

    pub fn compile_command(&self) -> Result<Option<CommandLine>, String> {
        self.compile
            .as_ref()
            .map(|template| command_line(template, &self.placeholders()))
            .transpose()
    }

    pub fn run_command(&self) -> Result<CommandLine, String> {
        command_line(&self.run, &self.placeholders())
    }
}

fn command_line(template: &[String], values: &[(&'static str, String)]) -> Result<CommandLine, String> {
    let mut argv = substitute(template, values)?;
    if argv.is_empty() {
        return Err("command template is empty".to_string());
    }
    let program = argv.remove(0);
    Ok(CommandLine {
        program,
        args: argv,
    })
}

/// Replaces `{name}` tokens inside each argument. Unknown names are an error.
pub fn substitute(template: &[String], values: &[(&str, String)]) -> Result<Vec<String>, String> {
    template
        .iter()
        .map(|arg| {
            let mut out = String::with_capacity(arg.len());
            let mut rest = arg.as_str();
            while let Some(start) = rest.find('{') {
                out.push_str(&rest[..start]);
                let tail = &rest[start + 1..];
                let end = tail
                    .find('}')
                    .ok_or_else(|| format!("unterminated placeholder in {arg:?}"))?;
                let key = &tail[..end];
                let value = values
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| value)
                    .ok_or_else(|| format!("unknown placeholder {{{key}}} in {arg:?}"))?;
                out.push_str(value);
                rest = &tail[end + 1..];
            }
            out.push_str(rest);
            Ok(out)
        })
        .collect()
}

/// Read-only table keyed by language identifier (e.g. `cpp`, `python`).
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    profiles: BTreeMap<String, LanguageProfile>,
}

impl LanguageTable {
    pub fn builtin() -> Self {
        let mut profiles = BTreeMap::new();
        let mut add = |id: &str, profile: LanguageProfile| {
            profiles.insert(id.to_string(), profile);
        };

        add(
            "c",
            profile(
                "C 17",
                "c",
                "main",
                &["/usr/bin/gcc", "-O2", "-std=c17", "-o", "{binary}", "{source}", "-lm"],
                &["./{binary}"],
            ),
        );
        add(
            "cpp",
            profile(
                "C++ 17",
                "cpp",
                "main",
                &["/usr/bin/g++", "-O2", "-std=c++17", "-o", "{binary}", "{source}"],
                &["./{binary}"],
            ),
        );
        add(
            "python",
            profile("Python 3", "py", "main", &[], &["/usr/bin/python3", "{source}"]),
        );
        add(
            "java",
            reserves_address_space(profile(
                "Java 17",
                "java",
                "Main",
                &["/usr/bin/javac", "-encoding", "UTF-8", "{source}"],
                &["/usr/bin/java", "-Xss64m", "-cp", ".", "{class}"],
            )),
        );
        add(
            "go",
            reserves_address_space(profile(
                "Go",
                "go",
                "main",
                &["/usr/bin/go", "build", "-o", "{binary}", "{source}"],
                &["./{binary}"],
            )),
        );
        add(
            "rust",
            profile(
                "Rust",
                "rs",
                "main",
                &["/usr/bin/rustc", "-O", "-o", "{binary}", "{source}"],
                &["./{binary}"],
            ),
        );
        add(
            "javascript",
            reserves_address_space(profile(
                "JavaScript (Node.js)",
                "js",
                "main",
                &[],
                &["/usr/bin/node", "{source}"],
            )),
        );

        Self { profiles }
    }

    /// Loads a JSON object of `id -> profile` replacing the built-in table.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let profiles: BTreeMap<String, LanguageProfile> = serde_json::from_str(&raw)
            .map_err(|e| format!("invalid language table {}: {e}", path.display()))?;
        let table = Self { profiles };
        table.validate()?;
        Ok(table)
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = (String, LanguageProfile)>) -> Self {
        Self {
            profiles: profiles.into_iter().collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&LanguageProfile> {
        self.profiles.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn profiles(&self) -> &BTreeMap<String, LanguageProfile> {
        &self.profiles
    }

    fn validate(&self) -> Result<(), String> {
        for (id, profile) in &self.profiles {
            profile
                .compile_command()
                .and_then(|_| profile.run_command())
                .map_err(|e| format!("language {id}: {e}"))?;
        }
        Ok(())
    }
}

fn profile(
    name: &str,
    extension: &str,
    stem: &str,
    compile: &[&str],
    run: &[&str],
) -> LanguageProfile {
    let owned = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
    LanguageProfile {
        name: name.to_string(),
        extension: extension.to_string(),
        source_stem: stem.to_string(),
        compile: (!compile.is_empty()).then(|| owned(compile)),
        run: owned(run),
        limit_address_space: true,
    }
}

fn reserves_address_space(profile: LanguageProfile) -> LanguageProfile {
    LanguageProfile {
        limit_address_space: false,
        ..profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_java_class_name() {
        let table = LanguageTable::builtin();
        let java = table.get("java").unwrap();
        assert_eq!(java.source_name(), "Main.java");
        let run = java.run_command().unwrap();
        assert_eq!(run.program, "/usr/bin/java");
        assert_eq!(run.args.last().unwrap(), "Main");
        assert!(!java.limit_address_space);
        assert!(table.get("cpp").unwrap().limit_address_space);
    }

    #[test]
    fn compiled_languages_produce_argument_vectors() {
        let table = LanguageTable::builtin();
        let cpp = table.get("cpp").unwrap().compile_command().unwrap().unwrap();
        assert_eq!(cpp.program, "/usr/bin/g++");
        assert!(cpp.args.contains(&"main.cpp".to_string()));
        assert!(table.get("python").unwrap().compile_command().unwrap().is_none());
        assert!(!table.contains("cobol"));
    }

    #[test]
    fn substitutes_inside_arguments_without_shell_parsing() {
        let values = [("source", "a b.c".to_string()), ("binary", "out".to_string())];
        let template = vec!["-o{binary}".to_string(), "{source}".to_string(), "x;rm".to_string()];
        assert_eq!(
            substitute(&template, &values).unwrap(),
            vec!["-oout", "a b.c", "x;rm"]
        );
    }

    #[test]
    fn rejects_unknown_or_unterminated_placeholders() {
        let values = [("source", "main.c".to_string())];
        assert!(substitute(&["{binray}".to_string()], &values).is_err());
        assert!(substitute(&["{source".to_string()], &values).is_err());
    }

    #[test]
    fn loads_table_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        std::fs::write(
            &path,
            r#"{"sh": {"name": "Shell", "extension": "sh", "run": ["/bin/sh", "{source}"]}}"#,
        )
        .unwrap();
        let table = LanguageTable::from_file(&path).unwrap();
        let sh = table.get("sh").unwrap();
        assert_eq!(sh.source_name(), "main.sh");
        assert_eq!(sh.run_command().unwrap().args, vec!["main.sh"]);
        assert!(sh.limit_address_space);
    }
}
