fn main() -> anyhow::Result<()> {
    archive_lib::run()
}
