fn main() -> anyhow::Result<()> {
    nearcast_lib::run()
}
