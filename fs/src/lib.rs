// Copyright 2024 Kevin Ludwig
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

pub use cardfs_err::*;

/// Filesystem-layer interface exposed to callers: mount once, then open or
/// create file handles and drive them with read/write/seek/close.
pub trait FileSystem {
    type Handle;

    fn mount(&mut self) -> Result<()>;

    fn open(&mut self, path: &str) -> Result<Self::Handle>;
    fn create(&mut self, path: &str) -> Result<Self::Handle>;

    fn read(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, handle: &mut Self::Handle, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, handle: &mut Self::Handle, offset: u64) -> Result<()>;

    fn close(&mut self, handle: Self::Handle) -> Result<()>;
}
