//! The key-action tree: what each key code means in each layer.
//!
//! A tree is built once by the config front-end and then shared read-only
//! across every resolver attached to devices using it. Layers are stored in
//! an arena; fall-through slots hold an index path back into the parent
//! layer instead of a borrowed reference, so the whole tree is a plain
//! owned value.

use std::sync::Arc;

use thiserror::Error;

/// Highest key code the kernel defines (`KEY_MAX`).
pub const KEY_MAX: u16 = 0x2ff;
/// Slots per keymap layer, one per possible code.
pub const KEY_COUNT: usize = KEY_MAX as usize + 1;
/// Longest chain of fall-through references a lookup will follow.
pub const MAX_REF_HOPS: usize = 32;

/// Index of a layer inside a [`KeymapTree`]; the root is always 0.
pub type LayerId = usize;

/// How a dual-role key decides between tap and hold when other keys
/// interleave with it (the timeout always forces hold).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualMode {
    /// Rolling onto another key keeps the tap meaning; hold needs a full
    /// press+release of another key (or the timeout). Fastest typing feel.
    TapOnRollover,
    /// Any other key press while undecided forces hold. Strict modifier feel.
    HoldOnRollover,
    /// Only the timeout forces hold; good for thumb keys hit during rolls.
    TimeoutOnly,
}

/// One step of a macro sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroStep {
    pub code: u16,
    pub press: bool,
}

/// Parameters of a dual-role key. The arms are restricted at build time:
/// neither may be another dual, and the tap arm may not be a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DualKey {
    pub tap: KeyAction,
    pub hold: KeyAction,
    pub mode: DualMode,
    pub hold_ms: i64,
    /// −1 disables double-tap repeat, 0 means any second tap repeats the
    /// tap arm, a positive value is the window in milliseconds.
    pub double_tap_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum KeyAction {
    /// Unassigned slot. Only exists before the build fill.
    #[default]
    None,
    /// Fall through to the same slot in the parent layer (build fill
    /// rewrites non-root `None` slots to this).
    Ref(LayerId, u16),
    /// Emit this code on press and the paired release on release.
    Simple(u16),
    /// Play the sequence once per press; the triggering release is silent.
    Macro(Arc<[MacroStep]>),
    /// Tap-or-hold, resolved by the waveform classifier.
    Dual(Arc<DualKey>),
    /// While held, presses look up through this layer.
    Map(LayerId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("key code {0} is outside the kernel range")]
    BadKeyCode(u16),
    #[error("a dual key's arm may not be another dual key")]
    DualOfDual,
    #[error("a dual key's tap arm may not be a layer")]
    DualTapMap,
    #[error("a dual key's arm must be a concrete action")]
    DualArmEmpty,
    #[error("macros must contain at least one step")]
    EmptyMacro,
    #[error("hold_ms must be positive, got {0}")]
    BadHoldMs(i64),
    #[error("double_tap_ms must be -1, 0 or positive, got {0}")]
    BadDoubleTapMs(i64),
    #[error("layer {0} does not exist")]
    BadLayer(usize),
    #[error("only concrete actions can be assigned to a slot")]
    NotConcrete,
    #[error("layers nest deeper than {MAX_REF_HOPS} levels")]
    TooDeep,
}

/// Builds a [`KeymapTree`], validating every invariant as actions are
/// assigned so the resolver never sees a malformed tree.
#[derive(Debug)]
pub struct KeymapTreeBuilder {
    layers: Vec<Vec<KeyAction>>,
    parents: Vec<Option<LayerId>>,
}

impl Default for KeymapTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeymapTreeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            layers: vec![vec![KeyAction::None; KEY_COUNT]],
            parents: vec![None],
        }
    }

    /// The root layer id.
    #[must_use]
    pub const fn root(&self) -> LayerId {
        0
    }

    /// Add an empty layer whose unassigned slots will fall through to
    /// `parent`.
    pub fn add_layer(&mut self, parent: LayerId) -> Result<LayerId, TreeError> {
        if parent >= self.layers.len() {
            return Err(TreeError::BadLayer(parent));
        }
        self.layers.push(vec![KeyAction::None; KEY_COUNT]);
        self.parents.push(Some(parent));
        Ok(self.layers.len() - 1)
    }

    /// Assign `action` to `code` in `layer`.
    pub fn set(&mut self, layer: LayerId, code: u16, action: KeyAction) -> Result<(), TreeError> {
        if layer >= self.layers.len() {
            return Err(TreeError::BadLayer(layer));
        }
        if code > KEY_MAX {
            return Err(TreeError::BadKeyCode(code));
        }
        self.validate(&action, false)?;
        self.layers[layer][usize::from(code)] = action;
        Ok(())
    }

    fn validate(&self, action: &KeyAction, inside_dual: bool) -> Result<(), TreeError> {
        match action {
            KeyAction::None | KeyAction::Ref(..) => Err(if inside_dual {
                TreeError::DualArmEmpty
            } else {
                TreeError::NotConcrete
            }),
            KeyAction::Simple(code) => {
                if *code > KEY_MAX {
                    return Err(TreeError::BadKeyCode(*code));
                }
                Ok(())
            }
            KeyAction::Macro(steps) => {
                if steps.is_empty() {
                    return Err(TreeError::EmptyMacro);
                }
                for step in steps.iter() {
                    if step.code > KEY_MAX {
                        return Err(TreeError::BadKeyCode(step.code));
                    }
                }
                Ok(())
            }
            KeyAction::Map(id) => {
                if *id >= self.layers.len() {
                    return Err(TreeError::BadLayer(*id));
                }
                Ok(())
            }
            KeyAction::Dual(dual) => {
                if inside_dual {
                    return Err(TreeError::DualOfDual);
                }
                if matches!(dual.tap, KeyAction::Dual(_)) || matches!(dual.hold, KeyAction::Dual(_))
                {
                    return Err(TreeError::DualOfDual);
                }
                if matches!(dual.tap, KeyAction::Map(_)) {
                    return Err(TreeError::DualTapMap);
                }
                if dual.hold_ms <= 0 {
                    return Err(TreeError::BadHoldMs(dual.hold_ms));
                }
                if dual.double_tap_ms < -1 {
                    return Err(TreeError::BadDoubleTapMs(dual.double_tap_ms));
                }
                self.validate(&dual.tap, true)?;
                self.validate(&dual.hold, true)
            }
        }
    }

    /// Run the fill pass and freeze the tree: unassigned root slots become
    /// identity mappings, unassigned child slots become fall-through
    /// references to the parent layer.
    pub fn build(mut self) -> Result<KeymapTree, TreeError> {
        for layer in 0..self.layers.len() {
            if self.depth(layer) >= MAX_REF_HOPS {
                return Err(TreeError::TooDeep);
            }
        }
        for layer in 0..self.layers.len() {
            let parent = self.parents[layer];
            for code in 0..KEY_COUNT {
                if self.layers[layer][code] != KeyAction::None {
                    continue;
                }
                self.layers[layer][code] = match parent {
                    None => KeyAction::Simple(code as u16),
                    Some(p) => KeyAction::Ref(p, code as u16),
                };
            }
        }
        Ok(KeymapTree {
            layers: self
                .layers
                .into_iter()
                .map(Vec::into_boxed_slice)
                .collect(),
        })
    }

    fn depth(&self, mut layer: LayerId) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.parents[layer] {
            depth += 1;
            layer = parent;
        }
        depth
    }
}

/// Immutable-after-build layer arena. Shared by reference across all
/// resolvers attached to devices using the same keymap.
#[derive(Debug)]
pub struct KeymapTree {
    layers: Vec<Box<[KeyAction]>>,
}

impl KeymapTree {
    /// The layer every resolver starts in.
    #[must_use]
    pub const fn root(&self) -> LayerId {
        0
    }

    /// Resolve `code` in `layer` to a terminal action, following at most
    /// [`MAX_REF_HOPS`] fall-through references.
    ///
    /// Panics on an unfilled slot or an exhausted chain; the builder makes
    /// both impossible, so hitting either is an internal bug.
    #[must_use]
    pub fn lookup(&self, layer: LayerId, code: u16) -> &KeyAction {
        let mut slot = &self.layers[layer][usize::from(code)];
        for _ in 0..MAX_REF_HOPS {
            match slot {
                KeyAction::Ref(parent, parent_code) => {
                    slot = &self.layers[*parent][usize::from(*parent_code)];
                }
                KeyAction::None => panic!("unfilled keymap slot for code {code}"),
                terminal => return terminal,
            }
        }
        panic!("keymap fall-through chain for code {code} exceeds {MAX_REF_HOPS} hops");
    }
}
