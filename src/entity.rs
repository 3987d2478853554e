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

//! Entity identifiers.

/// A 32-bit index and 32-bit generation packed into one word.
///
/// Id 0 is the "undefined" entity. Generation [`Entity::PROXY_GENERATION`]
/// marks placeholders handed out by command buffers before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Entity(u64);

impl Entity {
    /// Generation reserved for command-buffer proxies.
    pub const PROXY_GENERATION: u32 = u32::MAX;

    pub const fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    pub const fn undefined() -> Self {
        Self(0)
    }

    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn id(self) -> u64 {
        self.0
    }

    pub const fn is_undefined(self) -> bool {
        self.0 == 0
    }

    pub const fn is_proxy(self) -> bool {
        self.generation() == Self::PROXY_GENERATION
    }
}
