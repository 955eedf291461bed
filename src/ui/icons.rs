//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static STOP: Emoji<'_, '_> = Emoji("⏹️  ", "[STOP]");

// Pipeline steps
pub static SCALE: Emoji<'_, '_> = Emoji("⚖️  ", "[S]");
pub static SCISSORS: Emoji<'_, '_> = Emoji("✂️  ", "[C]");
pub static LAYERS: Emoji<'_, '_> = Emoji("📚 ", "[H]");
pub static OUTLINE: Emoji<'_, '_> = Emoji("🗂️  ", "[O]");
pub static SAVE: Emoji<'_, '_> = Emoji("💾 ", "[SAVE]");
