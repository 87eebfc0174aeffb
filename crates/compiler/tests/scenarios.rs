//! End-to-end compilation scenarios.
//!
//! Each program compiles to a complete PE32+ image which is then re-parsed
//! to verify the headers, the entry point, and pieces of the emitted code.
//! The images are Windows executables, so these tests verify the produced
//! bytes rather than process exit codes.

use tcc::{OutputKind, compile_file, compile_source};
use tcc_pe::{
    IMAGE_FILE_MACHINE_AMD64, IMAGE_SCN_CNT_CODE, IMAGE_SUBSYSTEM_WINDOWS_CUI, ImageInfo,
};

/// The scenario table: every program compiles cleanly and its image parses.
#[test]
fn scenario_programs_produce_valid_images() {
    let programs = [
        "int main() { return 7; }",
        "int main() { int a = 3, b = 4; return a * b + 2; }",
        "int main() { int i = 0, s = 0; while (i < 5) { s = s + i; i = i + 1; } return s; }",
        "int add2(int a, int b) { return a + b; } int main() { return add2(10, 20); }",
        "int f(int a, int b, int c, int d, int e, int g) { return a + b + c + d + e + g; }\n\
         int main() { return f(10, 20, 30, 40, 50, 60); }",
        "int main() { int x = 5; if (x > 3) return 1; else return 0; }",
    ];
    for program in programs {
        let image = compile_source("scenario.c", program).expect(program);
        let info = ImageInfo::parse(&image).expect("image parses");
        assert_eq!(info.machine, IMAGE_FILE_MACHINE_AMD64);
        assert_eq!(info.subsystem, IMAGE_SUBSYSTEM_WINDOWS_CUI);
        assert_eq!(info.image_base, 0x1_4000_0000);
        let text = &info.sections[0];
        assert_eq!(text.name, ".text");
        assert_eq!(text.virtual_address, 0x1000);
        assert_ne!(text.characteristics & IMAGE_SCN_CNT_CODE, 0);
        // the entry point lands inside .text
        assert!(info.entry_point >= text.virtual_address);
        assert!(info.entry_point < text.virtual_address + text.virtual_size);
    }
}

#[test]
fn return_seven_compiles_to_known_code() {
    let image = compile_source("ret7.c", "int main() { return 7; }").unwrap();
    let info = ImageInfo::parse(&image).unwrap();
    assert_eq!(info.entry_point, 0x1000);
    let text = info.section_data(&image, ".text").unwrap();
    let mut expected = Vec::new();
    // prologue with shadow-slot spills
    expected.extend_from_slice(&[
        0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x60, 0x48, 0x89, 0x4D, 0x10, 0x48, 0x89,
        0x55, 0x18, 0x4C, 0x89, 0x45, 0x20, 0x4C, 0x89, 0x4D, 0x28,
    ]);
    expected.extend_from_slice(&[0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00]); // mov rax, 7
    expected.extend_from_slice(&[0x48, 0x89, 0xEC, 0x5D, 0xC3]); // return
    expected.extend_from_slice(&[0x48, 0x89, 0xEC, 0x5D, 0xC3]); // fallthrough epilogue
    assert_eq!(&text[..expected.len()], &expected[..]);
    // the rest of the section is file-alignment padding
    assert!(text[expected.len()..].iter().all(|&b| b == 0));
}

#[test]
fn entry_point_is_section_alignment_plus_main_offset() {
    let image = compile_source(
        "two.c",
        "int helper() { return 3; } int main() { return helper(); }",
    )
    .unwrap();
    let info = ImageInfo::parse(&image).unwrap();
    let text = info.section_data(&image, ".text").unwrap();
    // main starts where helper's code ends: right after its two epilogues
    let main_offset = (info.entry_point - 0x1000) as usize;
    assert!(main_offset > 0);
    assert_eq!(&text[main_offset - 5..main_offset], &[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
    // and main begins with a prologue push rbp
    assert_eq!(text[main_offset], 0x55);
}

#[test]
fn compile_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("prog.c");
    let output = dir.path().join("prog.exe");
    std::fs::write(&input, "int main() { return 42; }").unwrap();

    compile_file(&input, &output, OutputKind::Exe).unwrap();

    let image = std::fs::read(&output).unwrap();
    assert_eq!(&image[..2], b"MZ");
    let info = ImageInfo::parse(&image).expect("written file parses");
    assert_eq!(info.entry_point, 0x1000);
}

#[test]
fn failed_compilation_writes_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bad.c");
    let output = dir.path().join("bad.exe");
    std::fs::write(&input, "int main() { int x = ; }").unwrap();

    let result = compile_file(&input, &output, OutputKind::Exe);
    assert!(result.is_err());
    assert!(!output.exists());
}

#[test]
fn object_output_is_a_stub() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("prog.c");
    std::fs::write(&input, "int main() { return 0; }").unwrap();
    let err = compile_file(&input, &dir.path().join("prog.obj"), OutputKind::Obj).unwrap_err();
    assert!(err.to_string().contains("not implemented"));
}

#[test]
fn strings_and_globals_lay_out_in_fixed_section_order() {
    let image = compile_source(
        "mix.c",
        "int counter = 9; int main() { char *s; s = \"hello\"; return counter; }",
    )
    .unwrap();
    let info = ImageInfo::parse(&image).unwrap();
    let names: Vec<&str> = info.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![".text", ".data", ".rdata"]);
    let rdata = info.section_data(&image, ".rdata").unwrap();
    assert_eq!(&rdata[..6], b"hello\0");
    let data = info.section_data(&image, ".data").unwrap();
    assert_eq!(&data[..4], &[9, 0, 0, 0]);
}

#[test]
fn larger_program_with_all_statement_forms() {
    let source = r#"
        int squares(int n) {
            int i, s;
            s = 0;
            for (i = 0; i < n; i = i + 1)
                s = s + i * i;
            return s;
        }

        int collatz_len(int n) {
            int len;
            len = 0;
            while (n != 1) {
                if (n % 2 == 0)
                    n = n / 2;
                else
                    n = 3 * n + 1;
                len = len + 1;
            }
            return len;
        }

        int main() {
            int total;
            total = squares(10) + collatz_len(27);
            do { total = total - 1; } while (total > 400);
            return total & 0xFF;
        }
    "#;
    let image = compile_source("big.c", source).unwrap();
    let info = ImageInfo::parse(&image).unwrap();
    // main is the third function
    assert!(info.entry_point > 0x1000);
}
