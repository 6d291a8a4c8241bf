//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");

// Session indicators
pub static NOTES: Emoji<'_, '_> = Emoji("🎵 ", "");
pub static PLAN: Emoji<'_, '_> = Emoji("🗺️  ", "[PLAN]");
pub static TEMPO: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
