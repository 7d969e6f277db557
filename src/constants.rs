pub const DATABASE_SUBFOLDER: &str = "Archive";
pub const CONFIG_DIR_NAME: &str = "expedient-archive";
pub const CONFIG_FILE_NAME: &str = "config.toml";
