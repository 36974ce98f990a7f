use kinject::{
    Bitness, Hex, Va,
    cipher::Cipher,
    codegen::{CodeGenerator, Convention, InitializerCall, emit_initializer_thunk},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    // The trampoline an injected module's initializer is called through.
    let call = InitializerCall {
        routine: Va(0x1800_2000),
        image_base: Va(0x1800_0000),
        reason: 1,
        data: Va(0x0010_1000),
    };

    for bitness in [Bitness::Wide, Bitness::Narrow] {
        let mut buffer = [0u8; 256];
        let mut generator = CodeGenerator::new(&mut buffer, bitness)?;
        let size = emit_initializer_thunk(&mut generator, &call)?;

        tracing::info!(?bitness, size, "initializer thunk");
        println!("{}", Hex(generator.code()));
    }

    // A plain cdecl call with cleanup.
    let mut buffer = [0u8; 64];
    let mut generator = CodeGenerator::new(&mut buffer, Bitness::Narrow)?;
    generator.push_uint32(0xDEAD_BEEF)?;
    generator.push_int8(-1)?;
    generator.call(Convention::Cdecl, Va(0x0040_1000))?;
    generator.ret(0)?;
    println!("{}", Hex(generator.code()));

    // Seal and open a payload.
    let cipher = Cipher::new([0x0123_4567, 0x89AB_CDEF, 0xFEDC_BA98, 0x7654_3210]);
    let sealed = cipher.encrypt(b"MZ payload", Some(0x1234_5678));
    let opened = cipher.decrypt(&sealed, None)?;

    tracing::info!(sealed = %Hex(sealed.as_slice()), "payload sealed");
    assert_eq!(opened, b"MZ payload");

    Ok(())
}
