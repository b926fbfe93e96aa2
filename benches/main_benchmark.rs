use criterion::{Criterion, criterion_group, criterion_main};
use inox::build::ctags::CtagsParser;
use inox::build::includes::extract_includes;
use inox::build::uptodate::unescape_dep;
use inox::properties::{PropertyMap, split_quoted};
use std::hint::black_box;
use std::path::Path;

const MOCK_PLATFORM: &str = r#"
name=Bench AVR
compiler.path={runtime.tools.avr-gcc.path}/bin/
compiler.c.cmd=avr-gcc
compiler.c.flags=-c -g -Os {compiler.warning_flags} -std=gnu11 -ffunction-sections -fdata-sections -MMD -flto
compiler.cpp.cmd=avr-g++
compiler.cpp.flags=-c -g -Os {compiler.warning_flags} -std=gnu++11 -fpermissive -fno-exceptions -MMD -flto
recipe.cpp.o.pattern="{compiler.path}{compiler.cpp.cmd}" {compiler.cpp.flags} -mmcu={build.mcu} -DF_CPU={build.f_cpu} -DARDUINO={runtime.ide.version} {includes} "{source_file}" -o "{object_file}"
runtime.tools.avr-gcc.path=/opt/arduino/tools/avr-gcc/7.3.0
compiler.warning_flags=-w
build.mcu=atmega328p
build.f_cpu=16000000L
runtime.ide.version=10607
includes="-I/opt/arduino/cores/arduino" "-I/opt/arduino/variants/standard"
source_file=/tmp/sketch/Blink.ino.cpp
object_file=/tmp/build/sketch/Blink.ino.cpp.o
"#;

const MOCK_SKETCH: &str = r##"
#include <Servo.h>
#include "config.h"
// #include <Commented.h>
/* #include <Block.h> */
#if 0
#include <Disabled.h>
#endif
const char *s = "#include <InString.h>";
#include <Wire.h>

void setup() {}
void loop() {}
"##;

const MOCK_TAGS: &str = "setup\t/tmp/sketch/Blink.ino\t/^void setup() {$/;\"\tkind:function\tline:3\tsignature:()\treturntype:void\n\
loop\t/tmp/sketch/Blink.ino\t/^void loop() {$/;\"\tkind:function\tline:6\tsignature:()\treturntype:void\n\
blink\t/tmp/sketch/Blink.ino\t/^static int blink(int pin) {$/;\"\tkind:function\tline:10\tsignature:(int pin)\treturntype:int\n";

fn bench_expand(c: &mut Criterion) {
    let props = PropertyMap::parse(MOCK_PLATFORM);
    c.bench_function("expand_compile_recipe", |b| {
        b.iter(|| props.expand(black_box(props.get("recipe.cpp.o.pattern"))))
    });
}

fn bench_split_quoted(c: &mut Criterion) {
    let props = PropertyMap::parse(MOCK_PLATFORM);
    let line = props.expand(props.get("recipe.cpp.o.pattern"));
    c.bench_function("split_quoted_command_line", |b| {
        b.iter(|| split_quoted(black_box(&line), "\"'", false).unwrap())
    });
}

fn bench_unescape_dep(c: &mut Criterion) {
    c.bench_function("unescape_dep", |b| {
        b.iter(|| unescape_dep(black_box(" /opt/my\\ libs/Servo/src/Servo.h \\")))
    });
}

fn bench_extract_includes(c: &mut Criterion) {
    c.bench_function("extract_includes", |b| b.iter(|| extract_includes(black_box(MOCK_SKETCH))));
}

fn bench_ctags_parse(c: &mut Criterion) {
    c.bench_function("ctags_parse", |b| {
        b.iter(|| CtagsParser::parse(black_box(MOCK_TAGS), Path::new("/tmp/sketch/Blink.ino")))
    });
}

criterion_group!(
    benches,
    bench_expand,
    bench_split_quoted,
    bench_unescape_dep,
    bench_extract_includes,
    bench_ctags_parse
);
criterion_main!(benches);
