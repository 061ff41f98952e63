//! TOML configuration front-end: device rules plus named keymaps,
//! materialized into compiled grab rules and key-action trees.
//!
//! ```toml
//! hold_ms = 200
//! double_tap_ms = -1
//!
//! [[device]]
//! pattern = "ergodox"
//! keymap = "main"
//!
//! [[device]]
//! pattern = "virtual"
//! ignore = true
//!
//! [keymaps.main]
//! capslock = "esc"
//! f = { tap = "f", hold = { layer = "nav" }, mode = "timeout_only" }
//! s = { tap = "s", hold = "leftshift", double_tap_ms = 300 }
//! copy = { macro = ["+leftctrl", "c", "-leftctrl"] }
//!
//! [keymaps.nav]
//! h = "left"
//! j = "down"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::RegexBuilder;
use serde::Deserialize;
use thiserror::Error;

use crate::grab::{GrabAction, GrabRule, GrabSet};
use crate::key_action::{
    DualKey, DualMode, KeyAction, KeymapTree, KeymapTreeBuilder, LayerId, MacroStep, TreeError,
};
use crate::names;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tapmux/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("hold_ms must be positive, got {0}")]
    GlobalHoldMs(i64),
    #[error("double_tap_ms must be -1, 0 or positive, got {0}")]
    GlobalDoubleTapMs(i64),
    #[error("device rule {index} ({pattern:?}): {source}")]
    BadPattern {
        index: usize,
        pattern: String,
        source: regex::Error,
    },
    #[error("device rule {index} must set exactly one of `ignore` or `keymap`")]
    RuleAction { index: usize },
    #[error("no keymap named {name:?}")]
    UnknownKeymap { name: String },
    #[error("keymap {keymap:?}: unknown key name {name:?}")]
    UnknownKeyName { keymap: String, name: String },
    #[error("keymap {keymap:?}: macro step {step:?} is not a key name")]
    BadMacroStep { keymap: String, step: String },
    #[error("keymap {keymap:?} reaches itself through its own layers")]
    LayerCycle { keymap: String },
    #[error("keymap {keymap:?}, key {key:?}: {source}")]
    BadAction {
        keymap: String,
        key: String,
        source: TreeError,
    },
    #[error("invalid keymap tree: {0}")]
    Tree(#[from] TreeError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_hold_ms")]
    hold_ms: i64,
    #[serde(default = "default_double_tap_ms")]
    double_tap_ms: i64,
    #[serde(default, rename = "device")]
    devices: Vec<DeviceRule>,
    #[serde(default)]
    keymaps: HashMap<String, KeymapSpec>,
}

const fn default_hold_ms() -> i64 {
    200
}

const fn default_double_tap_ms() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceRule {
    pattern: String,
    #[serde(default)]
    ignore: bool,
    keymap: Option<String>,
}

/// Key name → action, ordered so layer ids come out deterministic.
type KeymapSpec = BTreeMap<String, ActionSpec>;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ActionSpec {
    Dual {
        tap: Box<ActionSpec>,
        hold: Box<ActionSpec>,
        mode: Option<DualModeSpec>,
        hold_ms: Option<i64>,
        double_tap_ms: Option<i64>,
    },
    Macro {
        #[serde(rename = "macro")]
        steps: Vec<String>,
    },
    Layer {
        layer: String,
    },
    Simple(String),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DualModeSpec {
    TapOnRollover,
    HoldOnRollover,
    TimeoutOnly,
}

impl From<DualModeSpec> for DualMode {
    fn from(mode: DualModeSpec) -> Self {
        match mode {
            DualModeSpec::TapOnRollover => Self::TapOnRollover,
            DualModeSpec::HoldOnRollover => Self::HoldOnRollover,
            DualModeSpec::TimeoutOnly => Self::TimeoutOnly,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Defaults {
    hold_ms: i64,
    double_tap_ms: i64,
}

/// Loaded and materialized configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub grabs: GrabSet,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        if file.hold_ms <= 0 {
            return Err(ConfigError::GlobalHoldMs(file.hold_ms));
        }
        if file.double_tap_ms < -1 {
            return Err(ConfigError::GlobalDoubleTapMs(file.double_tap_ms));
        }
        let defaults = Defaults {
            hold_ms: file.hold_ms,
            double_tap_ms: file.double_tap_ms,
        };

        let mut trees: HashMap<String, Arc<KeymapTree>> = HashMap::new();
        let mut rules = Vec::with_capacity(file.devices.len());
        for (index, rule) in file.devices.iter().enumerate() {
            let regex = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::BadPattern {
                    index,
                    pattern: rule.pattern.clone(),
                    source,
                })?;
            let action = match (rule.ignore, &rule.keymap) {
                (true, None) => GrabAction::Ignore,
                (false, Some(name)) => {
                    let tree = match trees.get(name) {
                        Some(tree) => Arc::clone(tree),
                        None => {
                            let tree = Arc::new(build_tree(name, &file.keymaps, defaults)?);
                            trees.insert(name.clone(), Arc::clone(&tree));
                            tree
                        }
                    };
                    GrabAction::Grab(tree)
                }
                _ => return Err(ConfigError::RuleAction { index }),
            };
            rules.push(GrabRule::new(rule.pattern.clone(), regex, action));
        }
        Ok(Self {
            grabs: GrabSet::new(rules),
        })
    }
}

fn build_tree(
    root_name: &str,
    keymaps: &HashMap<String, KeymapSpec>,
    defaults: Defaults,
) -> Result<KeymapTree, ConfigError> {
    let mut builder = KeymapTreeBuilder::new();
    let root = builder.root();
    let mut path = vec![root_name.to_string()];
    populate_layer(&mut builder, root, root_name, keymaps, defaults, &mut path)?;
    Ok(builder.build()?)
}

fn populate_layer(
    builder: &mut KeymapTreeBuilder,
    layer: LayerId,
    name: &str,
    keymaps: &HashMap<String, KeymapSpec>,
    defaults: Defaults,
    path: &mut Vec<String>,
) -> Result<(), ConfigError> {
    let spec = keymaps
        .get(name)
        .ok_or_else(|| ConfigError::UnknownKeymap { name: name.into() })?;
    for (key, action_spec) in spec {
        let code = names::code_from_name(key).ok_or_else(|| ConfigError::UnknownKeyName {
            keymap: name.into(),
            name: key.clone(),
        })?;
        let action = convert_action(builder, layer, name, action_spec, keymaps, defaults, path)?;
        builder
            .set(layer, code, action)
            .map_err(|source| ConfigError::BadAction {
                keymap: name.into(),
                key: key.clone(),
                source,
            })?;
    }
    Ok(())
}

fn convert_action(
    builder: &mut KeymapTreeBuilder,
    layer: LayerId,
    keymap: &str,
    spec: &ActionSpec,
    keymaps: &HashMap<String, KeymapSpec>,
    defaults: Defaults,
    path: &mut Vec<String>,
) -> Result<KeyAction, ConfigError> {
    match spec {
        ActionSpec::Simple(key) => {
            let code = names::code_from_name(key).ok_or_else(|| ConfigError::UnknownKeyName {
                keymap: keymap.into(),
                name: key.clone(),
            })?;
            Ok(KeyAction::Simple(code))
        }
        ActionSpec::Macro { steps } => Ok(KeyAction::Macro(macro_steps(keymap, steps)?.into())),
        ActionSpec::Layer { layer: child_name } => {
            if path.iter().any(|seen| seen == child_name) {
                return Err(ConfigError::LayerCycle {
                    keymap: child_name.clone(),
                });
            }
            let child = builder.add_layer(layer)?;
            path.push(child_name.clone());
            populate_layer(builder, child, child_name, keymaps, defaults, path)?;
            path.pop();
            Ok(KeyAction::Map(child))
        }
        ActionSpec::Dual {
            tap,
            hold,
            mode,
            hold_ms,
            double_tap_ms,
        } => {
            let tap = convert_action(builder, layer, keymap, tap, keymaps, defaults, path)?;
            let hold = convert_action(builder, layer, keymap, hold, keymaps, defaults, path)?;
            Ok(KeyAction::Dual(Arc::new(DualKey {
                tap,
                hold,
                mode: mode.map_or(DualMode::TapOnRollover, DualMode::from),
                hold_ms: hold_ms.unwrap_or(defaults.hold_ms),
                double_tap_ms: double_tap_ms.unwrap_or(defaults.double_tap_ms),
            })))
        }
    }
}

/// Macro steps: `"key"` is a press+release pair, `"+key"` a bare press,
/// `"-key"` a bare release.
fn macro_steps(keymap: &str, steps: &[String]) -> Result<Vec<MacroStep>, ConfigError> {
    let mut out = Vec::with_capacity(steps.len() * 2);
    for step in steps {
        let (name, values): (&str, &[bool]) = if let Some(rest) = step.strip_prefix('+') {
            (rest, &[true])
        } else if let Some(rest) = step.strip_prefix('-') {
            (rest, &[false])
        } else {
            (step.as_str(), &[true, false])
        };
        let code = names::code_from_name(name).ok_or_else(|| ConfigError::BadMacroStep {
            keymap: keymap.into(),
            step: step.clone(),
        })?;
        for &press in values {
            out.push(MacroStep { code, press });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grab::GrabVerdict;

    const SAMPLE: &str = r#"
        hold_ms = 180
        double_tap_ms = 300

        [[device]]
        pattern = "virtual"
        ignore = true

        [[device]]
        pattern = "keyboard"
        keymap = "main"

        [keymaps.main]
        capslock = "esc"
        f = { tap = "f", hold = { layer = "nav" }, mode = "timeout_only", hold_ms = 200, double_tap_ms = -1 }
        s = { tap = "s", hold = "leftshift" }
        copy = { macro = ["+leftctrl", "c", "-leftctrl"] }

        [keymaps.nav]
        h = "left"
        j = "down"
    "#;

    #[test]
    fn parses_rules_in_order() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.grabs.rules().len(), 2);
        assert_eq!(
            config.grabs.verdict("My Virtual Keyboard"),
            GrabVerdict::Ignore(0)
        );
        assert_eq!(config.grabs.verdict("USB Keyboard"), GrabVerdict::Grab(1));
        assert_eq!(config.grabs.verdict("Trackball"), GrabVerdict::NoMatch);
    }

    #[test]
    fn materializes_the_tree() {
        let config = Config::parse(SAMPLE).unwrap();
        let tree = config.grabs.tree(1).unwrap();
        let root = tree.root();

        // capslock -> esc
        assert_eq!(tree.lookup(root, 58), &KeyAction::Simple(1));
        // unmapped keys are identity
        assert_eq!(tree.lookup(root, 30), &KeyAction::Simple(30));

        // f is a dual whose hold arm is the nav layer
        let KeyAction::Dual(dual) = tree.lookup(root, 33) else {
            panic!("f should be a dual key");
        };
        assert_eq!(dual.tap, KeyAction::Simple(33));
        assert_eq!(dual.mode, DualMode::TimeoutOnly);
        assert_eq!(dual.hold_ms, 200);
        assert_eq!(dual.double_tap_ms, -1);
        let KeyAction::Map(nav) = &dual.hold else {
            panic!("f's hold arm should be a layer");
        };
        let nav = *nav;
        // nav remaps h and falls through everywhere else
        assert_eq!(tree.lookup(nav, 35), &KeyAction::Simple(105));
        assert_eq!(tree.lookup(nav, 58), &KeyAction::Simple(1));
        assert_eq!(tree.lookup(nav, 30), &KeyAction::Simple(30));
    }

    #[test]
    fn dual_inherits_global_defaults() {
        let config = Config::parse(SAMPLE).unwrap();
        let tree = config.grabs.tree(1).unwrap();
        let KeyAction::Dual(dual) = tree.lookup(tree.root(), 31) else {
            panic!("s should be a dual key");
        };
        assert_eq!(dual.hold_ms, 180);
        assert_eq!(dual.double_tap_ms, 300);
        assert_eq!(dual.mode, DualMode::TapOnRollover);
    }

    #[test]
    fn macro_steps_expand() {
        let config = Config::parse(SAMPLE).unwrap();
        let tree = config.grabs.tree(1).unwrap();
        let KeyAction::Macro(steps) = tree.lookup(tree.root(), 133) else {
            panic!("copy should be a macro");
        };
        let expect = [(29, true), (46, true), (46, false), (29, false)];
        let got: Vec<(u16, bool)> = steps.iter().map(|s| (s.code, s.press)).collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn rejects_unknown_key_name() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "kb"
            keymap = "main"
            [keymaps.main]
            hyperkey = "esc"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKeyName { .. }));
    }

    #[test]
    fn rejects_unknown_keymap_reference() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "kb"
            keymap = "missing"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKeymap { .. }));
    }

    #[test]
    fn rejects_rule_without_action() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "kb"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::RuleAction { index: 0 }));
    }

    #[test]
    fn rejects_layer_cycle() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "kb"
            keymap = "a"
            [keymaps.a]
            f = { layer = "b" }
            [keymaps.b]
            g = { layer = "a" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::LayerCycle { .. }));
    }

    #[test]
    fn rejects_dual_inside_dual() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "kb"
            keymap = "main"
            [keymaps.main]
            f = { tap = { tap = "f", hold = "leftshift" }, hold = "leftctrl" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BadAction {
                source: TreeError::DualOfDual,
                ..
            }
        ));
    }

    #[test]
    fn rejects_empty_macro() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "kb"
            keymap = "main"
            [keymaps.main]
            f = { macro = [] }
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BadAction {
                source: TreeError::EmptyMacro,
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_pattern() {
        let err = Config::parse(
            r#"
            [[device]]
            pattern = "(unclosed"
            ignore = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::BadPattern { index: 0, .. }));
    }

    #[test]
    fn empty_config_is_valid_but_grabs_nothing() {
        let config = Config::parse("").unwrap();
        assert!(config.grabs.is_empty());
        assert_eq!(config.grabs.verdict("anything"), GrabVerdict::NoMatch);
    }
}
