//! Container emission: ABC serialization and the SWF movie envelope.

use swf::avm2::types::AbcFile;
use swf::{
    Compression, DoAbc2, DoAbc2Flag, FileAttributes, Fixed8, FrameLabel, Header, Rectangle,
    SwfStr, SymbolClassLink, Tag, Twips,
};

use crate::error::{CompileError, Result};

/// Stage size in twips (500×375 px).
const STAGE_WIDTH: i32 = 10000;
const STAGE_HEIGHT: i32 = 7500;

pub fn write_abc(abc: AbcFile) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut writer = swf::avm2::write::Writer::new(&mut bytes);
    writer.write(abc).map_err(|e| CompileError::Internal {
        func: "module".to_string(),
        message: format!("abc serialization failed: {e}"),
    })?;
    Ok(bytes)
}

/// Wrap an ABC blob in a minimal loadable movie. `main_class` is registered
/// as the SymbolClass for character 0 (the main timeline).
pub fn wrap_swf(abc: &[u8], main_class: &str) -> Result<Vec<u8>> {
    let header = Header {
        compression: Compression::None,
        version: 19,
        stage_size: Rectangle {
            x_min: Twips::new(0),
            x_max: Twips::new(STAGE_WIDTH),
            y_min: Twips::new(0),
            y_max: Twips::new(STAGE_HEIGHT),
        },
        frame_rate: Fixed8::from_f32(24.0),
        num_frames: 1,
    };
    let frame1 = SwfStr::from_utf8_str("frame1");
    let tags = vec![
        Tag::FileAttributes(FileAttributes::IS_ACTION_SCRIPT_3 | FileAttributes::USE_NETWORK_SANDBOX),
        Tag::FrameLabel(FrameLabel {
            label: frame1,
            is_anchor: false,
        }),
        Tag::DoAbc2(DoAbc2 {
            flags: DoAbc2Flag::LAZY_INITIALIZE,
            name: frame1,
            data: abc,
        }),
        Tag::SymbolClass(vec![SymbolClassLink {
            id: 0,
            class_name: SwfStr::from_utf8_str(main_class),
        }]),
        Tag::ShowFrame,
    ];

    let mut out = Vec::new();
    swf::write_swf(&header, &tags, &mut out).map_err(|e| CompileError::Internal {
        func: "module".to_string(),
        message: format!("swf serialization failed: {e}"),
    })?;
    Ok(out)
}
