//! Decides which basic blocks get instrumented at all.

use core::{fmt, str::FromStr};

use distafl_bolts::{rands::Rand, Error};
use serde::{Deserialize, Serialize};

/// The environment variable holding the instrumentation ratio
pub const INST_RATIO_ENV: &str = "AFL_INST_RATIO";

/// The percentage of basic blocks to instrument, in `1..=100`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct InstRatio(u32);

impl InstRatio {
    /// Instrument everything
    pub const ALL: InstRatio = InstRatio(100);

    /// The ratio in percent
    #[must_use]
    pub fn percent(&self) -> u32 {
        self.0
    }
}

impl Default for InstRatio {
    fn default() -> Self {
        Self::ALL
    }
}

impl TryFrom<u32> for InstRatio {
    type Error = Error;

    fn try_from(percent: u32) -> Result<Self, Self::Error> {
        if (1..=100).contains(&percent) {
            Ok(Self(percent))
        } else {
            Err(Error::illegal_argument(format!(
                "Bad value of {INST_RATIO_ENV} (must be between 1 and 100), got {percent}"
            )))
        }
    }
}

impl From<InstRatio> for u32 {
    fn from(ratio: InstRatio) -> Self {
        ratio.0
    }
}

impl FromStr for InstRatio {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let percent = s.trim().parse::<u32>().map_err(|_| {
            Error::illegal_argument(format!(
                "Bad value of {INST_RATIO_ENV} (must be between 1 and 100), got {s:?}"
            ))
        })?;
        Self::try_from(percent)
    }
}

impl fmt::Display for InstRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Per-block coin toss against the configured [`InstRatio`].
#[derive(Debug, Copy, Clone, Default)]
pub struct SamplingPolicy {
    ratio: InstRatio,
}

impl SamplingPolicy {
    /// Creates a new policy
    #[must_use]
    pub fn new(ratio: InstRatio) -> Self {
        Self { ratio }
    }

    /// The configured ratio
    #[must_use]
    pub fn ratio(&self) -> InstRatio {
        self.ratio
    }

    /// Draws a number in `0..100`; the block is skipped iff the draw is `>=` the ratio.
    pub fn should_instrument<R: Rand>(&self, rand: &mut R) -> bool {
        rand.below(100) < u64::from(self.ratio.0)
    }
}

#[cfg(test)]
mod tests {
    use distafl_bolts::{
        rands::{StdRand, XkcdRand},
        Error,
    };

    use super::{InstRatio, SamplingPolicy};

    #[test]
    fn test_ratio_bounds() {
        assert!(matches!(
            "0".parse::<InstRatio>(),
            Err(Error::IllegalArgument(..))
        ));
        assert!("101".parse::<InstRatio>().is_err());
        assert!("-5".parse::<InstRatio>().is_err());
        assert!("ten".parse::<InstRatio>().is_err());
        assert!("".parse::<InstRatio>().is_err());
        assert_eq!("1".parse::<InstRatio>().unwrap().percent(), 1);
        assert_eq!(" 100 ".parse::<InstRatio>().unwrap(), InstRatio::ALL);
        assert_eq!(InstRatio::default().percent(), 100);
    }

    #[test]
    fn test_full_ratio_never_skips() {
        let policy = SamplingPolicy::new(InstRatio::ALL);
        let mut rand = StdRand::with_seed(7);
        assert!((0..10_000).all(|_| policy.should_instrument(&mut rand)));
        // even the largest possible draw, 99, is below 100
        assert!(policy.should_instrument(&mut XkcdRand::with_value(u64::MAX)));
    }

    #[test]
    fn test_low_ratio_skips_high_draws() {
        let policy = SamplingPolicy::new(InstRatio::try_from(1).unwrap());
        assert!(policy.should_instrument(&mut XkcdRand::with_value(0)));
        assert!(!policy.should_instrument(&mut XkcdRand::with_value(u64::MAX)));

        let half = SamplingPolicy::new(InstRatio::try_from(50).unwrap());
        let mut rand = StdRand::with_seed(0xAF1);
        let taken = (0..10_000)
            .filter(|_| half.should_instrument(&mut rand))
            .count();
        assert!((4_000..6_000).contains(&taken), "took {taken}");
    }
}
