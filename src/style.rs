//! Terminal styling for CLI output
//!
//! Semantic colors for the status report: green/yellow/red for state,
//! cyan for headers and identifiers, dim for secondary information.

use crossterm::style::Stylize;

/// Semantic styling on top of crossterm's `Stylize`
///
/// ```
/// use sonos_volume_sync::style::SyncStyle;
///
/// println!("{}", "Remote speaker".header());
/// println!("{}", "reachable".success());
/// ```
pub trait SyncStyle: Stylize {
    /// Section headers (cyan bold)
    fn header(self) -> <<Self as Stylize>::Styled as Stylize>::Styled
    where
        Self: Sized,
        <Self as Stylize>::Styled: Stylize,
    {
        self.cyan().bold()
    }

    /// Healthy state: reachable, active, forwarded
    fn success(self) -> <Self as Stylize>::Styled
    where
        Self: Sized,
    {
        self.green()
    }

    /// Broken state: unreachable, failed
    fn error(self) -> <Self as Stylize>::Styled
    where
        Self: Sized,
    {
        self.red()
    }

    /// Degraded state: passthrough, unknown
    fn warning(self) -> <Self as Stylize>::Styled
    where
        Self: Sized,
    {
        self.yellow()
    }

    /// Names, addresses, levels
    fn technical(self) -> <Self as Stylize>::Styled
    where
        Self: Sized,
    {
        self.cyan()
    }
}

impl<T: Stylize> SyncStyle for T {}

/// Render a yes/no flag with state colors
#[must_use]
pub fn yes_no(flag: bool) -> String {
    if flag {
        "yes".success().to_string()
    } else {
        "no".error().to_string()
    }
}
