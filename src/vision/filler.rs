//! Filler clips played while recognition is still working

use std::path::Path;

use rand::seq::SliceRandom;

use crate::Result;
use crate::voice::AudioClip;

/// A set of short exclamation clips
#[derive(Debug, Clone, Default)]
pub struct FillerClips {
    clips: Vec<AudioClip>,
}

impl FillerClips {
    /// Use the given clips
    #[must_use]
    pub const fn new(clips: Vec<AudioClip>) -> Self {
        Self { clips }
    }

    /// Load every `.mp3` and `.wav` file in `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory or a clip cannot be read
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("mp3") || e.eq_ignore_ascii_case("wav"))
            })
            .collect();
        paths.sort();

        let clips = paths
            .iter()
            .map(|path| std::fs::read(path).map(AudioClip::from))
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::debug!(dir = %dir.display(), count = clips.len(), "loaded filler clips");
        Ok(Self { clips })
    }

    /// A uniformly random clip, if any are loaded
    #[must_use]
    pub fn pick(&self) -> Option<AudioClip> {
        self.clips.choose(&mut rand::thread_rng()).cloned()
    }

    /// Number of clips
    #[must_use]
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    /// Whether no clips are loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}
