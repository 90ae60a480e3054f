//! Per-chunk constant pool resolver.
//!
//! Binds the method map to the class and string dictionaries that live for
//! the recording, plus fresh package and symbol dictionaries whose ids are
//! dense within the current chunk and biased with `base_id` on emission.

use rustc_demangle::try_demangle;

use crate::recording::dictionary::Dictionary;
use crate::recording::frames::{CallFrame, FrameType, MethodId};
use crate::recording::method_map::{MethodInfo, MethodMap};
use crate::recording::runtime::{self, BridgeRef, LineNumberEntry};

const NATIVE_MODIFIERS: u32 = 0x100;

pub struct Lookup<'a> {
    pub method_map: &'a mut MethodMap,
    pub classes: &'a Dictionary,
    pub strings: &'a Dictionary,
    pub packages: Dictionary,
    pub symbols: Dictionary,
    bridge: Option<BridgeRef>,
}

struct FillData {
    class_id: u32,
    name_id: u32,
    sig_id: u32,
    frame_type: FrameType,
    modifiers: Option<u32>,
    is_entry: Option<bool>,
    line_numbers: Option<Vec<LineNumberEntry>>,
}

impl<'a> Lookup<'a> {
    pub fn new(
        method_map: &'a mut MethodMap,
        classes: &'a Dictionary,
        strings: &'a Dictionary,
    ) -> Self {
        Self {
            method_map,
            classes,
            strings,
            packages: Dictionary::new(),
            symbols: Dictionary::new(),
            bridge: runtime::bridge(),
        }
    }

    /// Resolve a frame to its method record, assigning a key on first
    /// observation and refreshing the per-chunk symbol ids when the record
    /// has not been touched since the last chunk.
    pub fn resolve(&mut self, frame: &CallFrame) -> &MethodInfo {
        let first_time = !self.method_map.contains(&frame.method);
        if first_time {
            let key = self.method_map.len() as u32 + 1;
            self.method_map
                .insert(frame.method.clone(), MethodInfo::with_key(key));
        }
        let needs_fill = match self.method_map.get(&frame.method) {
            Some(mi) => !mi.mark,
            None => true,
        };
        if needs_fill {
            let fill = self.compute_fill(frame, first_time);
            if let Some(mi) = self.method_map.get_mut(&frame.method) {
                mi.mark = true;
                mi.class_id = fill.class_id;
                mi.name_id = fill.name_id;
                mi.sig_id = fill.sig_id;
                mi.frame_type = fill.frame_type;
                if let Some(modifiers) = fill.modifiers {
                    mi.modifiers = modifiers;
                }
                if let Some(is_entry) = fill.is_entry {
                    mi.is_entry = is_entry;
                }
                if let Some(lines) = fill.line_numbers {
                    mi.line_numbers = lines;
                }
            }
        }
        self.method_map
            .get(&frame.method)
            .expect("method inserted above")
    }

    fn compute_fill(&self, frame: &CallFrame, first_time: bool) -> FillData {
        match &frame.method {
            MethodId::Managed(method) => self.fill_managed(*method, first_time),
            MethodId::Native(symbol) => self.fill_native(symbol),
            MethodId::Status(text) => FillData {
                class_id: self.classes.lookup(""),
                name_id: self.symbols.lookup(text),
                sig_id: self.symbols.lookup("()L;"),
                frame_type: FrameType::Native,
                modifiers: Some(NATIVE_MODIFIERS),
                is_entry: None,
                line_numbers: None,
            },
        }
    }

    fn fill_native(&self, symbol: &str) -> FillData {
        let class_id = self.classes.lookup("");
        let base = FillData {
            class_id,
            name_id: 0,
            sig_id: 0,
            frame_type: FrameType::Native,
            modifiers: Some(NATIVE_MODIFIERS),
            is_entry: None,
            line_numbers: None,
        };

        if symbol.starts_with("_Z") {
            if let Ok(demangled) = try_demangle(symbol) {
                let mut pretty = format!("{demangled:#}");
                cut_arguments(&mut pretty);
                return FillData {
                    name_id: self.symbols.lookup(&pretty),
                    sig_id: self.symbols.lookup("()L;"),
                    frame_type: FrameType::Cpp,
                    ..base
                };
            }
        }

        if let Some(stripped) = symbol.strip_suffix("_[k]") {
            FillData {
                name_id: self.symbols.lookup(stripped),
                sig_id: self.symbols.lookup("(Lk;)L;"),
                frame_type: FrameType::Kernel,
                ..base
            }
        } else {
            FillData {
                name_id: self.symbols.lookup(symbol),
                sig_id: self.symbols.lookup("()L;"),
                ..base
            }
        }
    }

    fn fill_managed(&self, method: u64, first_time: bool) -> FillData {
        let details = self
            .bridge
            .as_ref()
            .ok_or(())
            .and_then(|b| b.method_details(method).map_err(|_| ()));
        let details = match details {
            Ok(d) => d,
            Err(()) => {
                // degraded record: placeholder class and a status name
                return FillData {
                    class_id: self.classes.lookup(""),
                    name_id: self.symbols.lookup("jvmtiError"),
                    sig_id: self.symbols.lookup("()L;"),
                    frame_type: FrameType::Native,
                    modifiers: None,
                    is_entry: None,
                    line_numbers: None,
                };
            }
        };

        let mut fill = FillData {
            class_id: self.classes.lookup(&details.class_name),
            name_id: self.symbols.lookup(&details.method_name),
            sig_id: self.symbols.lookup(&details.signature),
            frame_type: FrameType::Interpreted,
            modifiers: None,
            is_entry: None,
            line_numbers: None,
        };

        if first_time {
            // hidden-frame markers propagate from the class, whose constant
            // is written without modifiers
            let mut modifiers = details.modifiers;
            if details.class_modifiers & 0x1000 != 0 {
                modifiers |= 0x1000;
            }
            if details.class_modifiers & 0x0040 != 0 {
                modifiers |= 0x0040;
            }
            let is_entry = (details.method_name == "run"
                && details.signature == "()V"
                && details.extends_thread)
                || (details.method_name == "main"
                    && details.signature == "([Ljava/lang/String;)V"
                    && (modifiers & 9) != 0);
            fill.modifiers = Some(modifiers);
            fill.is_entry = Some(is_entry);
            fill.line_numbers = Some(details.line_numbers);
        }

        fill
    }

    /// Package id for an internal class name: everything before the last
    /// slash, skipping array prefixes and backing over hidden-class suffixes
    /// such as `com/example/Foo/0x0123`.
    pub fn package_id(&self, class_name: &str) -> u32 {
        let Some(mut end) = class_name.rfind('/') else {
            return 0;
        };
        let bytes = class_name.as_bytes();
        if bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit()) {
            match class_name[..end].rfind('/') {
                Some(prev) => end = prev,
                None => return 0,
            }
        }
        let mut start = 0;
        if bytes[0] == b'[' {
            match class_name.find('L') {
                Some(l) => start = l + 1,
                None => return 0,
            }
        }
        if start >= end {
            return 0;
        }
        self.packages.lookup(&class_name[start..end])
    }

    pub fn symbol_id(&self, name: &str) -> u32 {
        self.symbols.lookup(name)
    }
}

/// Strip a trailing argument list from a demangled name, respecting nested
/// parentheses.
fn cut_arguments(name: &mut String) {
    let cut = {
        let Some(close) = name.rfind(')') else { return };
        let bytes = name.as_bytes();
        let mut balance = 1i32;
        let mut i = close;
        let mut cut = None;
        while i > 0 {
            i -= 1;
            match bytes[i] {
                b'(' => {
                    balance -= 1;
                    if balance == 0 {
                        cut = Some(i);
                        break;
                    }
                }
                b')' => balance += 1,
                _ => {}
            }
        }
        cut
    };
    if let Some(at) = cut {
        name.truncate(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::frames::CallFrame;

    fn lookup_parts() -> (MethodMap, Dictionary, Dictionary) {
        (MethodMap::new(), Dictionary::new(), Dictionary::new())
    }

    #[test]
    fn test_native_frame_resolution() {
        let (mut map, classes, strings) = lookup_parts();
        let mut lookup = Lookup::new(&mut map, &classes, &strings);
        let frame = CallFrame::native("read");
        let info = lookup.resolve(&frame);
        assert_eq!(info.key, 1);
        assert!(info.mark);
        assert_eq!(info.frame_type, FrameType::Native);
        assert_eq!(info.modifiers, NATIVE_MODIFIERS);
    }

    #[test]
    fn test_kernel_suffix_classification() {
        let (mut map, classes, strings) = lookup_parts();
        let mut lookup = Lookup::new(&mut map, &classes, &strings);
        let info = lookup.resolve(&CallFrame::native("finish_task_switch_[k]"));
        assert_eq!(info.frame_type, FrameType::Kernel);
        let name_id = info.name_id;
        assert_eq!(lookup.symbols.lookup("finish_task_switch"), name_id);
    }

    #[test]
    fn test_mangled_symbol_is_demangled_as_cpp() {
        let (mut map, classes, strings) = lookup_parts();
        let mut lookup = Lookup::new(&mut map, &classes, &strings);
        // legacy Itanium-style mangling that rustc-demangle understands
        let info = lookup.resolve(&CallFrame::native("_ZN4core3ptr13drop_in_place17h1234567890abcdefE"));
        assert_eq!(info.frame_type, FrameType::Cpp);
        let symbols = lookup.symbols.collect();
        assert!(symbols
            .values()
            .any(|s| s.contains("drop_in_place")), "demangled name interned: {symbols:?}");
    }

    #[test]
    fn test_keys_are_dense_and_stable() {
        let (mut map, classes, strings) = lookup_parts();
        let mut lookup = Lookup::new(&mut map, &classes, &strings);
        let k1 = lookup.resolve(&CallFrame::native("a")).key;
        let k2 = lookup.resolve(&CallFrame::native("b")).key;
        let k1_again = lookup.resolve(&CallFrame::native("a")).key;
        assert_eq!((k1, k2), (1, 2));
        assert_eq!(k1, k1_again);
    }

    #[test]
    fn test_unresolvable_managed_method_degrades() {
        // no bridge installed for this map; managed resolution must fall
        // back to the placeholder record
        let (mut map, classes, strings) = lookup_parts();
        let mut lookup = Lookup::new(&mut map, &classes, &strings);
        lookup.bridge = None;
        let info = lookup.resolve(&CallFrame::managed(0xdead, 3));
        assert_eq!(info.frame_type, FrameType::Native);
        let name = lookup.symbols.collect();
        assert!(name.values().any(|s| &**s == "jvmtiError"));
    }

    #[test]
    fn test_package_derivation() {
        let (mut map, classes, strings) = lookup_parts();
        let lookup = Lookup::new(&mut map, &classes, &strings);
        assert_ne!(lookup.package_id("java/lang/String"), 0);
        let packages = lookup.packages.collect();
        assert!(packages.values().any(|p| &**p == "java/lang"));
        assert_eq!(lookup.package_id("TopLevel"), 0);
    }

    #[test]
    fn test_package_skips_array_prefix() {
        let (mut map, classes, strings) = lookup_parts();
        let lookup = Lookup::new(&mut map, &classes, &strings);
        lookup.package_id("[Ljava/util/Map;");
        let packages = lookup.packages.collect();
        assert!(packages.values().any(|p| &**p == "java/util"));
    }

    #[test]
    fn test_package_backs_over_hidden_class_suffix() {
        let (mut map, classes, strings) = lookup_parts();
        let lookup = Lookup::new(&mut map, &classes, &strings);
        lookup.package_id("com/example/Foo/0x0123");
        let packages = lookup.packages.collect();
        assert!(packages.values().any(|p| &**p == "com/example"));
    }

    #[test]
    fn test_cut_arguments() {
        let mut s = String::from("ns::func(int, std::pair<int, int>)");
        cut_arguments(&mut s);
        assert_eq!(s, "ns::func");
        let mut no_args = String::from("plain_symbol");
        cut_arguments(&mut no_args);
        assert_eq!(no_args, "plain_symbol");
    }
}
