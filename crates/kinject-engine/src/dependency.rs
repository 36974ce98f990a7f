use kinject_core::path::ends_with_ignore_case;

bitflags::bitflags! {
    /// System modules that must be loaded in a process before injecting.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Dependencies: u32 {
        /// Native `ntdll.dll`.
        const NTDLL = 1 << 0;

        /// `ntdll.dll` of the translated subsystem.
        const NTDLL_TRANSLATED = 1 << 1;

        /// The translation layer.
        const WOW64 = 1 << 2;

        /// The windowing part of the translation layer.
        const WOW64WIN = 1 << 3;

        /// The CPU part of the translation layer.
        const WOW64CPU = 1 << 4;

        /// Native `kernel32.dll`.
        const KERNEL32 = 1 << 5;

        /// `kernel32.dll` of the translated subsystem.
        const KERNEL32_TRANSLATED = 1 << 6;

        /// Native `user32.dll`.
        const USER32 = 1 << 7;

        /// `user32.dll` of the translated subsystem.
        const USER32_TRANSLATED = 1 << 8;
    }
}

/// Path suffixes of the dependency modules.
///
/// Hosts report full device paths, so only the tail is compared.
const DEPENDENCY_PATHS: [(&str, Dependencies); 9] = [
    (r"\System32\ntdll.dll", Dependencies::NTDLL),
    (r"\SysWOW64\ntdll.dll", Dependencies::NTDLL_TRANSLATED),
    (r"\System32\wow64.dll", Dependencies::WOW64),
    (r"\System32\wow64win.dll", Dependencies::WOW64WIN),
    (r"\System32\wow64cpu.dll", Dependencies::WOW64CPU),
    (r"\System32\kernel32.dll", Dependencies::KERNEL32),
    (r"\SysWOW64\kernel32.dll", Dependencies::KERNEL32_TRANSLATED),
    (r"\System32\user32.dll", Dependencies::USER32),
    (r"\SysWOW64\user32.dll", Dependencies::USER32_TRANSLATED),
];

impl Dependencies {
    /// Returns the dependency the image path refers to, if any.
    pub fn from_image_path(path: &str) -> Self {
        DEPENDENCY_PATHS
            .iter()
            .find(|(suffix, _)| ends_with_ignore_case(path, suffix))
            .map(|&(_, dependency)| dependency)
            .unwrap_or_default()
    }

    /// Returns the set of dependencies a process must have loaded.
    pub fn required(translated: bool, legacy_translated_gating: bool) -> Self {
        let mut required = Self::NTDLL;

        if translated {
            required |= Self::WOW64 | Self::WOW64WIN | Self::WOW64CPU | Self::NTDLL_TRANSLATED;

            if legacy_translated_gating {
                required |= Self::KERNEL32
                    | Self::KERNEL32_TRANSLATED
                    | Self::USER32
                    | Self::USER32_TRANSLATED;
            }
        } else {
            required |= Self::KERNEL32 | Self::USER32;
        }

        required
    }
}
