// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide string interning.
//!
//! Maps strings to stable [`HashedString`] ids so components can carry a
//! 4-byte handle instead of owned text. Interned strings live for the
//! process; resolution hands back `'static` slices.

use std::sync::OnceLock;

use ahash::AHashMap;
use parking_lot::Mutex;

/// Stable id of an interned string. Id 0 is "undefined".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HashedString(u32);

impl HashedString {
    pub const UNDEFINED: HashedString = HashedString(0);

    pub fn id(self) -> u32 {
        self.0
    }

    pub fn is_undefined(self) -> bool {
        self.0 == 0
    }
}

#[derive(Default)]
struct InternerState {
    // Strings are leaked so ids resolve to 'static slices; the table owns
    // the process lifetime anyway.
    strings: Vec<&'static str>,
    ids: AHashMap<&'static str, u32>,
}

static INTERNER: OnceLock<Mutex<InternerState>> = OnceLock::new();

fn state() -> &'static Mutex<InternerState> {
    INTERNER.get_or_init(|| Mutex::new(InternerState::default()))
}

/// Returns the id for `text`, interning it on first sight.
pub fn intern(text: &str) -> HashedString {
    let mut interner = state().lock();
    if let Some(&id) = interner.ids.get(text) {
        return HashedString(id);
    }
    let stored: &'static str = Box::leak(text.to_owned().into_boxed_str());
    interner.strings.push(stored);
    let id = interner.strings.len() as u32;
    interner.ids.insert(stored, id);
    HashedString(id)
}

/// Resolves an id back to its string. `None` for undefined or unknown ids.
pub fn resolve(handle: HashedString) -> Option<&'static str> {
    if handle.is_undefined() {
        return None;
    }
    state().lock().strings.get(handle.0 as usize - 1).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = intern("meshes/crate.obj");
        let b = intern("meshes/crate.obj");
        assert_eq!(a, b);
        assert!(!a.is_undefined());
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let a = intern("shaders/depth.vert");
        let b = intern("shaders/depth.frag");
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_round_trips() {
        let id = intern("textures/albedo.png");
        assert_eq!(resolve(id), Some("textures/albedo.png"));
        assert_eq!(resolve(HashedString::UNDEFINED), None);
    }
}
