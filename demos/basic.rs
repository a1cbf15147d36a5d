use aqmp::{Client, Endpoint};

#[tokio::main(flavor = "current_thread")]
async fn main() -> aqmp::Result<()> {
    // Adjust the path to your environment.
    let endpoint = Endpoint::unix("/var/run/qemu-server/100.qmp");

    let client = Client::builder().name("vm100").connect(&endpoint).await?;
    if let Some(greeting) = client.greeting() {
        let v = &greeting.qmp.version.qemu;
        println!("QEMU {}.{}.{}", v.major, v.minor, v.micro);
    }

    let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    println!("status = {status}");

    client.disconnect().await
}
