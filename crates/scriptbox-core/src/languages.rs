//! Language descriptors known to the engine.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LanguageDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub short: &'static str,
    pub extension: &'static str,
    pub sample: &'static str,
}

pub const JAVASCRIPT: LanguageDescriptor = LanguageDescriptor {
    id: "javascript",
    name: "JavaScript",
    short: "JS",
    extension: "js",
    sample: r#"console.log('Hello, world!');

// Try entering your name:
const name = await input('Your name: ');
console.log('Hello, ' + name + '!');
console.log('Done!');
"#,
};

pub const PYTHON: LanguageDescriptor = LanguageDescriptor {
    id: "python",
    name: "Python",
    short: "PY",
    extension: "py",
    sample: r#"print("Hello from Python!")

name = input("What's your name? ")
print(f"Nice to meet you, {name}!")
"#,
};

pub const LUA: LanguageDescriptor = LanguageDescriptor {
    id: "lua",
    name: "Lua",
    short: "LU",
    extension: "lua",
    sample: r#"print("Hello from Lua!")
io.write("Your name: ")
local name = io.read()
print("Hello, " .. name .. "!")
"#,
};

pub static LANGUAGES: [LanguageDescriptor; 3] = [JAVASCRIPT, PYTHON, LUA];

pub fn find_language(id: &str) -> Option<&'static LanguageDescriptor> {
    LANGUAGES.iter().find(|lang| lang.id == id)
}

/// Resolve a language from a file extension, with or without the leading dot.
pub fn language_for_extension(extension: &str) -> Option<&'static LanguageDescriptor> {
    let extension = extension.trim_start_matches('.');
    LANGUAGES
        .iter()
        .find(|lang| lang.extension.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_language_by_id() {
        assert_eq!(find_language("lua").map(|l| l.name), Some("Lua"));
        assert_eq!(find_language("python").map(|l| l.short), Some("PY"));
        assert!(find_language("cobol").is_none());
    }

    #[test]
    fn test_language_for_extension() {
        assert_eq!(language_for_extension(".js").map(|l| l.id), Some("javascript"));
        assert_eq!(language_for_extension("PY").map(|l| l.id), Some("python"));
        assert!(language_for_extension("rs").is_none());
    }
}
